//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;
use walkdir::WalkDir;

use crate::errors::DeployError;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

/// A regular file found while walking a directory tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Path relative to the walked root, `/`-separated
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), DeployError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Recursively list regular files, sorted by relative path.
    /// Symlinks are not followed.
    pub async fn walk_files(&self) -> Result<Vec<TreeEntry>, DeployError> {
        let root = self.path.clone();
        tokio::task::spawn_blocking(move || walk_blocking(&root))
            .await
            .map_err(|e| DeployError::Internal(format!("directory walk panicked: {e}")))?
    }
}

fn walk_blocking(root: &Path) -> Result<Vec<TreeEntry>, DeployError> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            DeployError::IoError(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory loop")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| DeployError::Internal(e.to_string()))?;
        let relative_path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let metadata = entry.metadata().map_err(|e| {
            DeployError::IoError(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("metadata unavailable")),
            )
        })?;

        entries.push(TreeEntry {
            relative_path,
            absolute_path: entry.path().to_path_buf(),
            size: metadata.len(),
        });
    }

    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(entries)
}
