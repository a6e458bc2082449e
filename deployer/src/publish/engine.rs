//! Diff-aware uploads to the site store
//!
//! Only files whose content hash differs from the previous version are
//! uploaded, each tagged with the headers of its cache class. Uploads run
//! on a bounded number of concurrent tasks and are retried individually;
//! if any file still fails the whole publish fails.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::manifest::{ManifestEntry, Version};
use crate::cache::classifier::{classify, content_type};
use crate::errors::DeployError;
use crate::providers::{ObjectHeaders, ObjectStore};
use crate::publish::source::FileSource;
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::settings::PublishSettings;

/// What a publish would do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishPlan {
    /// New or changed files
    pub uploads: Vec<ManifestEntry>,
    /// Keys to remove from the site store
    pub deletions: Vec<String>,
    pub unchanged: usize,
}

impl PublishPlan {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.deletions.is_empty()
    }

    /// Site-relative paths whose served content changes
    pub fn changed_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .uploads
            .iter()
            .map(|e| e.path.clone())
            .chain(self.deletions.iter().cloned())
            .collect();
        paths.sort();
        paths
    }
}

/// What a publish did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReport {
    pub uploaded: Vec<String>,
    pub deleted: Vec<String>,
    /// Uploaded and deleted paths, sorted; input to invalidation planning
    pub changed_paths: Vec<String>,
    pub unchanged: usize,
}

/// Uploads file sources to the site store
#[derive(Clone)]
pub struct PublishEngine {
    site: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    concurrency: usize,
    delete_removed: bool,
    cancel: CancellationToken,
}

impl PublishEngine {
    pub fn new(site: Arc<dyn ObjectStore>, settings: &PublishSettings) -> Self {
        Self {
            site,
            retry: settings.retry.clone(),
            concurrency: settings.concurrency.max(1),
            delete_removed: settings.delete_removed,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_delete_removed(mut self, delete_removed: bool) -> Self {
        self.delete_removed = delete_removed;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Compare `source` against `previous`. Without a previous version
    /// every file is an upload.
    pub fn diff(&self, source: &dyn FileSource, previous: Option<&Version>) -> PublishPlan {
        let previous_hashes = previous.map(|v| v.hashes()).unwrap_or_default();

        let mut plan = PublishPlan::default();
        for entry in source.entries() {
            match previous_hashes.get(entry.path.as_str()) {
                Some(hash) if *hash == entry.hash => plan.unchanged += 1,
                _ => plan.uploads.push(entry.clone()),
            }
        }

        if self.delete_removed {
            if let Some(previous) = previous {
                plan.deletions = previous
                    .manifest
                    .iter()
                    .filter(|old| {
                        source
                            .entries()
                            .binary_search_by(|e| e.path.as_str().cmp(old.path.as_str()))
                            .is_err()
                    })
                    .map(|old| old.path.clone())
                    .collect();
            }
        }
        plan
    }

    /// Diff and publish in one step
    pub async fn publish(
        &self,
        source: Arc<dyn FileSource>,
        previous: Option<&Version>,
    ) -> Result<PublishReport, DeployError> {
        let plan = self.diff(source.as_ref(), previous);
        self.execute(source, &plan).await
    }

    /// Upload every planned file, then delete removed keys
    pub async fn execute(
        &self,
        source: Arc<dyn FileSource>,
        plan: &PublishPlan,
    ) -> Result<PublishReport, DeployError> {
        info!(
            "Publishing {} to {}: {} uploads, {} deletions, {} unchanged",
            source.describe(),
            self.site.describe(),
            plan.uploads.len(),
            plan.deletions.len(),
            plan.unchanged
        );

        // Dropping the set aborts uploads still running
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for entry in plan.uploads.iter().cloned() {
            let sem = Arc::clone(&semaphore);
            let engine = self.clone();
            let source = Arc::clone(&source);
            tasks.spawn(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|e| DeployError::Internal(e.to_string()))?;
                engine.upload(source.as_ref(), &entry).await?;
                Ok::<_, DeployError>(entry.path)
            });
        }

        let mut uploaded = Vec::with_capacity(plan.uploads.len());
        let mut failures: Vec<DeployError> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(path)) => uploaded.push(path),
                Ok(Err(e)) => failures.push(e),
                Err(e) => failures.push(DeployError::Internal(format!("upload task failed: {e}"))),
            }
        }

        if !failures.is_empty() {
            if failures.iter().all(|e| matches!(e, DeployError::Cancelled(_))) {
                return Err(DeployError::Cancelled(format!(
                    "publish cancelled after {} uploads",
                    uploaded.len()
                )));
            }
            let first = failures
                .iter()
                .find(|e| !matches!(e, DeployError::Cancelled(_)))
                .map(|e| e.to_string())
                .unwrap_or_default();
            return Err(DeployError::Publish(format!(
                "{} of {} uploads failed; first error: {}",
                failures.len(),
                plan.uploads.len(),
                first
            )));
        }

        let mut deleted = Vec::with_capacity(plan.deletions.len());
        for path in &plan.deletions {
            debug!("Deleting {}", path);
            with_retry(&self.retry, &format!("delete {path}"), &self.cancel, || {
                self.site.delete_object(path)
            })
            .await
            .map_err(|e| DeployError::Publish(format!("delete {path}: {e}")))?;
            deleted.push(path.clone());
        }

        uploaded.sort();
        let mut changed_paths: Vec<String> = uploaded.iter().chain(deleted.iter()).cloned().collect();
        changed_paths.sort();

        info!("Published {} files, deleted {}", uploaded.len(), deleted.len());
        Ok(PublishReport {
            uploaded,
            deleted,
            changed_paths,
            unchanged: plan.unchanged,
        })
    }

    async fn upload(&self, source: &dyn FileSource, entry: &ManifestEntry) -> Result<(), DeployError> {
        let body = source.read(entry).await?;
        let policy = classify(&entry.path);
        let headers = ObjectHeaders::new(policy.cache_control, content_type(&entry.path));
        debug!("Uploading {} ({}, {} bytes)", entry.path, policy.class, entry.size);

        with_retry(&self.retry, &format!("upload {}", entry.path), &self.cancel, || {
            self.site.put_object(&entry.path, body.clone(), &headers)
        })
        .await
        .inspect_err(|e| warn!("Upload of {} failed: {}", entry.path, e))
    }
}
