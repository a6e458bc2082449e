//! Key layout of the state store

/// Key layout for versions, history and the lease
#[derive(Debug, Clone, Default)]
pub struct StorageLayout {
    /// Prefix for every key, empty or ending in `/`
    pub prefix: String,
}

impl StorageLayout {
    /// Create a new storage layout under `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into().trim_matches('/').to_string();
        if !prefix.is_empty() {
            prefix.push('/');
        }
        Self { prefix }
    }

    fn key(&self, rest: &str) -> String {
        format!("{}{}", self.prefix, rest)
    }

    /// Versions index (newest first, with the current pointer)
    pub fn index_key(&self) -> String {
        self.key("versions/index.json")
    }

    /// Prefix under which version manifests live
    pub fn versions_prefix(&self) -> String {
        self.key("versions/")
    }

    /// Manifest of one version
    pub fn manifest_key(&self, version_id: &str) -> String {
        self.key(&format!("versions/{version_id}/manifest.json"))
    }

    /// Prefix of the content-addressed blob store
    pub fn blobs_prefix(&self) -> String {
        self.key("blobs/")
    }

    /// Content-addressed blob, sharded by the first two hex digits
    pub fn blob_key(&self, content_hash: &str) -> String {
        let shard = &content_hash[..2.min(content_hash.len())];
        self.key(&format!("blobs/{shard}/{content_hash}"))
    }

    /// Invalidation history log
    pub fn invalidation_history_key(&self) -> String {
        self.key("invalidations/history.json")
    }

    /// Finalized deployment record
    pub fn deployment_key(&self, deployment_id: &str) -> String {
        self.key(&format!("deployments/{deployment_id}.json"))
    }

    /// Deployments index (newest first)
    pub fn deployments_index_key(&self) -> String {
        self.key("deployments/index.json")
    }

    /// Advisory deployment lease
    pub fn lease_key(&self, name: &str) -> String {
        self.key(&format!("locks/{name}.lease.json"))
    }
}
