//! Version and index documents

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::classifier::CacheClass;
use crate::utils::sha256_hash;

/// One file of a published build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Site-relative path, `/`-separated, no leading slash
    pub path: String,
    pub size: u64,
    /// Hex SHA-256 of the contents
    pub hash: String,
    pub cache_class: CacheClass,
}

/// An immutable record of one published build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    /// Sorted by path
    pub manifest: Vec<ManifestEntry>,
    pub total_size: u64,
    pub file_count: usize,
}

impl Version {
    pub fn new(
        id: String,
        created_at: DateTime<Utc>,
        source_ref: Option<String>,
        mut manifest: Vec<ManifestEntry>,
    ) -> Self {
        manifest.sort_by(|a, b| a.path.cmp(&b.path));
        let total_size = manifest.iter().map(|e| e.size).sum();
        let file_count = manifest.len();
        Self {
            id,
            created_at,
            source_ref,
            manifest,
            total_size,
            file_count,
        }
    }

    pub fn entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.manifest
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.manifest[i])
    }

    /// Path to content hash
    pub fn hashes(&self) -> HashMap<&str, &str> {
        self.manifest
            .iter()
            .map(|e| (e.path.as_str(), e.hash.as_str()))
            .collect()
    }

    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            file_count: self.file_count,
            total_size: self.total_size,
            source_ref: self.source_ref.clone(),
        }
    }
}

/// Digest over every `(path, hash)` pair of a manifest
pub fn aggregate_digest(entries: &[ManifestEntry]) -> String {
    let mut sorted: Vec<&ManifestEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut buf = String::new();
    for entry in sorted {
        buf.push_str(&entry.path);
        buf.push('\0');
        buf.push_str(&entry.hash);
        buf.push('\n');
    }
    sha256_hash(buf.as_bytes())
}

/// Index entry for one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub total_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
}

/// The versions index. The only document that decides which versions exist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionIndex {
    /// Version currently served
    #[serde(default)]
    pub current: Option<String>,

    /// Set when a publish failed part way; the next deploy republishes
    /// everything
    #[serde(default)]
    pub dirty: bool,

    /// Newest first
    #[serde(default)]
    pub versions: Vec<VersionSummary>,
}

impl VersionIndex {
    pub fn find(&self, id: &str) -> Option<&VersionSummary> {
        self.versions.iter().find(|v| v.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Insert keeping newest-first order
    pub fn insert(&mut self, summary: VersionSummary) {
        self.versions.retain(|v| v.id != summary.id);
        let at = self
            .versions
            .iter()
            .position(|v| v.id < summary.id)
            .unwrap_or(self.versions.len());
        self.versions.insert(at, summary);
    }
}
