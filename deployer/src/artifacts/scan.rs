//! Build tree scanning
//!
//! Walks a build directory and hashes every regular file. Hashing runs on
//! a bounded number of concurrent tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::artifacts::manifest::ManifestEntry;
use crate::cache::classifier::classify_class;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::utils::sha256_hash;

/// Max files hashed at once
const MAX_CONCURRENT: usize = 16;

/// A file found in the build tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub entry: ManifestEntry,
    pub absolute_path: PathBuf,
}

/// Scan `root`. Fails with `ArtifactIo` when the tree is missing, empty or
/// unreadable.
pub async fn scan_tree(root: &Path) -> Result<Vec<ScannedFile>, DeployError> {
    let dir = Dir::new(root);
    if !dir.exists().await {
        return Err(DeployError::ArtifactIo(format!(
            "build directory {} does not exist",
            root.display()
        )));
    }

    let files = dir.walk_files().await.map_err(|e| {
        DeployError::ArtifactIo(format!("cannot walk {}: {}", root.display(), e))
    })?;
    if files.is_empty() {
        return Err(DeployError::ArtifactIo(format!(
            "build directory {} is empty",
            root.display()
        )));
    }
    info!("Scanning {} files in {}", files.len(), root.display());

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT));
    let mut handles = Vec::with_capacity(files.len());

    for file in files {
        let sem = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = sem
                .acquire()
                .await
                .map_err(|e| DeployError::Internal(e.to_string()))?;
            let contents = tokio::fs::read(&file.absolute_path).await.map_err(|e| {
                DeployError::ArtifactIo(format!("cannot read {}: {}", file.relative_path, e))
            })?;
            let entry = ManifestEntry {
                cache_class: classify_class(&file.relative_path),
                hash: sha256_hash(&contents),
                size: contents.len() as u64,
                path: file.relative_path,
            };
            debug!("Scanned {} ({})", entry.path, entry.cache_class);
            Ok::<_, DeployError>(ScannedFile {
                entry,
                absolute_path: file.absolute_path,
            })
        }));
    }

    let mut scanned = Vec::with_capacity(handles.len());
    for handle in handles {
        let file = handle
            .await
            .map_err(|e| DeployError::Internal(format!("scan task panicked: {e}")))??;
        scanned.push(file);
    }

    scanned.sort_by(|a, b| a.entry.path.cmp(&b.entry.path));
    Ok(scanned)
}
