//! Where published files come from
//!
//! A deploy publishes a freshly built directory; a rollback publishes a
//! captured version out of the artifact store. Both look the same to the
//! publish engine.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::artifacts::manifest::{ManifestEntry, Version};
use crate::artifacts::scan::scan_tree;
use crate::artifacts::store::ArtifactStore;
use crate::errors::DeployError;
use crate::utils::sha256_hash;

/// A set of files with known hashes
#[async_trait]
pub trait FileSource: Send + Sync {
    fn describe(&self) -> String;

    /// Every file, sorted by path
    fn entries(&self) -> &[ManifestEntry];

    /// Contents of one entry. Fails if they no longer match the entry's hash.
    async fn read(&self, entry: &ManifestEntry) -> Result<Bytes, DeployError>;
}

/// A build output directory
#[derive(Debug, Clone)]
pub struct BuildDirSource {
    root: PathBuf,
    entries: Vec<ManifestEntry>,
}

impl BuildDirSource {
    /// Scan `root`; fails with `ArtifactIo` when it is empty or unreadable
    pub async fn scan(root: &Path) -> Result<Self, DeployError> {
        let entries = scan_tree(root)
            .await?
            .into_iter()
            .map(|file| file.entry)
            .collect();
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileSource for BuildDirSource {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    async fn read(&self, entry: &ManifestEntry) -> Result<Bytes, DeployError> {
        let contents = tokio::fs::read(self.root.join(&entry.path))
            .await
            .map_err(|e| DeployError::ArtifactIo(format!("cannot read {}: {}", entry.path, e)))?;
        if sha256_hash(&contents) != entry.hash {
            return Err(DeployError::ArtifactIo(format!(
                "{} changed while deploying",
                entry.path
            )));
        }
        Ok(Bytes::from(contents))
    }
}

/// A captured version, read back from the artifact store
#[derive(Clone)]
pub struct VersionSource {
    artifacts: ArtifactStore,
    version: Version,
}

impl VersionSource {
    pub fn new(artifacts: ArtifactStore, version: Version) -> Self {
        Self { artifacts, version }
    }

    pub fn version(&self) -> &Version {
        &self.version
    }
}

#[async_trait]
impl FileSource for VersionSource {
    fn describe(&self) -> String {
        format!("version {}", self.version.id)
    }

    fn entries(&self) -> &[ManifestEntry] {
        &self.version.manifest
    }

    async fn read(&self, entry: &ManifestEntry) -> Result<Bytes, DeployError> {
        self.artifacts.read_blob(&entry.hash).await
    }
}
