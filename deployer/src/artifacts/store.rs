//! Versioned history of published builds
//!
//! Layout in the state store:
//!
//! ```text
//! blobs/<aa>/<sha256>              file contents, stored once per hash
//! versions/<id>/manifest.json      one manifest per version
//! versions/index.json              the commit point
//! ```
//!
//! A capture writes blobs, then the manifest, then commits the index with an
//! optimistic conditional write. Readers only trust the index, so a capture
//! that dies part way leaves unreferenced objects behind but never a
//! visible version. Prune commits the index first and deletes files after.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::manifest::{aggregate_digest, ManifestEntry, Version, VersionIndex, VersionSummary};
use crate::cache::classifier::classify_class;
use crate::errors::DeployError;
use crate::providers::{ObjectHeaders, ObjectStore, Precondition};
use crate::publish::source::FileSource;
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::document::{read_json, update_json, write_json_if};
use crate::storage::layout::StorageLayout;
use crate::utils::{sha256_hash, time_ordered_id};

/// Versions always kept, whatever their age
pub const DEFAULT_MIN_RETAINED: usize = 5;

const DEFAULT_CONCURRENCY: usize = 8;

const SNAPSHOT_SOURCE_REF: &str = "pre-rollback-snapshot";

/// Outcome of a prune
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Pruned version ids, newest first
    pub removed: Vec<String>,
    pub retained: usize,
    pub blobs_deleted: usize,
}

/// Owner of the versions index, manifests and blobs
#[derive(Clone)]
pub struct ArtifactStore {
    store: Arc<dyn ObjectStore>,
    layout: StorageLayout,
    retry: RetryPolicy,
    concurrency: usize,
    min_retained: usize,
    cancel: CancellationToken,
}

impl ArtifactStore {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StorageLayout) -> Self {
        Self {
            store,
            layout,
            retry: RetryPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
            min_retained: DEFAULT_MIN_RETAINED,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_min_retained(mut self, min_retained: usize) -> Self {
        self.min_retained = min_retained;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// The versions index; empty when nothing was ever captured
    pub async fn index(&self) -> Result<VersionIndex, DeployError> {
        Ok(read_json::<VersionIndex>(self.store.as_ref(), &self.layout.index_key())
            .await?
            .map(|(index, _)| index)
            .unwrap_or_default())
    }

    /// Versions, most recent first
    pub async fn list(&self, limit: usize) -> Result<Vec<VersionSummary>, DeployError> {
        let index = self.index().await?;
        Ok(index.versions.into_iter().take(limit).collect())
    }

    /// Fails with `NotFound` unless the index references `version_id`
    pub async fn get(&self, version_id: &str) -> Result<Version, DeployError> {
        let index = self.index().await?;
        if !index.contains(version_id) {
            return Err(DeployError::NotFound(format!("version {version_id}")));
        }
        self.read_manifest(version_id).await
    }

    /// The version currently served, if known
    pub async fn current(&self) -> Result<Option<Version>, DeployError> {
        match self.index().await?.current {
            Some(id) => Ok(Some(self.read_manifest(&id).await?)),
            None => Ok(None),
        }
    }

    async fn read_manifest(&self, version_id: &str) -> Result<Version, DeployError> {
        let key = self.layout.manifest_key(version_id);
        match read_json::<Version>(self.store.as_ref(), &key).await? {
            Some((version, _)) => Ok(version),
            None => Err(DeployError::NotFound(format!(
                "manifest of version {version_id}"
            ))),
        }
    }

    /// Capture every file of `source` as a new version and make it current
    pub async fn capture(
        &self,
        source: Arc<dyn FileSource>,
        source_ref: Option<String>,
    ) -> Result<Version, DeployError> {
        let entries = source.entries().to_vec();
        if entries.is_empty() {
            return Err(DeployError::ArtifactIo(format!(
                "nothing to capture in {}",
                source.describe()
            )));
        }
        info!("Capturing {} files from {}", entries.len(), source.describe());

        // One upload per distinct content hash
        let mut unique: HashMap<String, ManifestEntry> = HashMap::new();
        for entry in &entries {
            unique.entry(entry.hash.clone()).or_insert_with(|| entry.clone());
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for entry in unique.into_values() {
            let sem = Arc::clone(&semaphore);
            let artifacts = self.clone();
            let source = Arc::clone(&source);
            tasks.spawn(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|e| DeployError::Internal(e.to_string()))?;
                let body = source.read(&entry).await?;
                artifacts.store_blob(&entry.hash, body).await
            });
        }
        join_all_ok(tasks).await?;

        self.commit_version(entries, source_ref, true).await
    }

    /// Capture what the site store serves right now. The snapshot is
    /// recorded in the index but does not become current.
    pub async fn snapshot(&self, site: Arc<dyn ObjectStore>) -> Result<Version, DeployError> {
        let objects = site.list_objects("").await?;
        info!("Snapshotting {} objects from {}", objects.len(), site.describe());

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for object in objects {
            let sem = Arc::clone(&semaphore);
            let artifacts = self.clone();
            let site = Arc::clone(&site);
            tasks.spawn(async move {
                let _permit = sem
                    .acquire()
                    .await
                    .map_err(|e| DeployError::Internal(e.to_string()))?;
                let key = object.key.clone();
                let fetched = with_retry(&artifacts.retry, &format!("get {key}"), &artifacts.cancel, || {
                    site.get_object(&key)
                })
                .await?;
                let hash = sha256_hash(&fetched.body);
                let entry = ManifestEntry {
                    cache_class: classify_class(&object.key),
                    size: fetched.body.len() as u64,
                    hash: hash.clone(),
                    path: object.key,
                };
                artifacts.store_blob(&hash, fetched.body).await?;
                Ok(entry)
            });
        }
        let mut entries = join_all_ok(tasks).await?;
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        self.commit_version(entries, Some(SNAPSHOT_SOURCE_REF.to_string()), false)
            .await
    }

    async fn commit_version(
        &self,
        entries: Vec<ManifestEntry>,
        source_ref: Option<String>,
        make_current: bool,
    ) -> Result<Version, DeployError> {
        let digest = aggregate_digest(&entries);
        let id = time_ordered_id(Utc::now(), &digest[..8]);
        let version = Version::new(id.clone(), Utc::now(), source_ref, entries);

        write_json_if(
            self.store.as_ref(),
            &self.layout.manifest_key(&id),
            &version,
            Precondition::DoesNotExist,
        )
        .await?;

        let summary = version.summary();
        update_json(self.store.as_ref(), &self.layout.index_key(), |index: &mut VersionIndex| {
            index.insert(summary.clone());
            if make_current {
                index.current = Some(summary.id.clone());
                index.dirty = false;
            }
            Ok(())
        })
        .await?;

        info!(
            "Committed version {} ({} files, {} bytes)",
            version.id, version.file_count, version.total_size
        );
        Ok(version)
    }

    async fn store_blob(&self, hash: &str, body: Bytes) -> Result<(), DeployError> {
        let key = self.layout.blob_key(hash);
        let headers = ObjectHeaders::new("private, max-age=31536000, immutable", "application/octet-stream");
        let result = with_retry(&self.retry, &format!("store blob {hash}"), &self.cancel, || {
            self.store
                .put_object_if(&key, body.clone(), &headers, Precondition::DoesNotExist)
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            // Content-addressed: an existing blob already holds these bytes
            Err(DeployError::PreconditionFailed(_)) => {
                debug!("Blob {} already stored", hash);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Contents of a blob, verified against its hash
    pub async fn read_blob(&self, hash: &str) -> Result<Bytes, DeployError> {
        let key = self.layout.blob_key(hash);
        let object = with_retry(&self.retry, &format!("read blob {hash}"), &self.cancel, || {
            self.store.get_object(&key)
        })
        .await
        .map_err(|e| match e {
            DeployError::NotFound(_) => DeployError::ArtifactIo(format!("blob {hash} is missing")),
            other => other,
        })?;
        if sha256_hash(&object.body) != hash {
            return Err(DeployError::ArtifactIo(format!("blob {hash} is corrupt")));
        }
        Ok(object.body)
    }

    /// Point `current` at an indexed version and clear the dirty flag
    pub async fn set_current(&self, version_id: &str) -> Result<(), DeployError> {
        update_json(self.store.as_ref(), &self.layout.index_key(), |index: &mut VersionIndex| {
            if !index.contains(version_id) {
                return Err(DeployError::NotFound(format!("version {version_id}")));
            }
            index.current = Some(version_id.to_string());
            index.dirty = false;
            Ok(())
        })
        .await
    }

    /// Record that the site store may no longer match `current`
    pub async fn mark_dirty(&self) -> Result<(), DeployError> {
        update_json(self.store.as_ref(), &self.layout.index_key(), |index: &mut VersionIndex| {
            index.dirty = true;
            Ok(())
        })
        .await
    }

    /// Drop versions older than `max_age` or beyond the `max_count` most
    /// recent. The current version is never pruned and counts toward
    /// `max_count`. The newest `min(min_retained, max_count)` versions
    /// survive any age.
    ///
    /// Callers hold the deployment lease: blob collection assumes no
    /// capture is in flight.
    pub async fn prune(
        &self,
        max_age: chrono::Duration,
        max_count: usize,
    ) -> Result<PruneReport, DeployError> {
        let now = Utc::now();
        let max_count = max_count.max(1);

        let (removed, retained) = update_json(
            self.store.as_ref(),
            &self.layout.index_key(),
            |index: &mut VersionIndex| {
                let current = index.current.clone();
                let current_position = current
                    .as_deref()
                    .and_then(|id| index.versions.iter().position(|v| v.id == id));
                let window = retention_window(current_position, max_count);
                let floor = self.min_retained.min(window);
                let (kept, removed): (Vec<_>, Vec<_>) = index
                    .versions
                    .drain(..)
                    .enumerate()
                    .partition(|(position, v)| {
                        retain(v, *position, current.as_deref(), now, max_age, window, floor)
                    });
                index.versions = kept.into_iter().map(|(_, v)| v).collect();
                let removed: Vec<String> = removed.into_iter().map(|(_, v)| v.id).collect();
                let retained: Vec<String> = index.versions.iter().map(|v| v.id.clone()).collect();
                Ok((removed, retained))
            },
        )
        .await?;

        if !removed.is_empty() {
            info!("Pruned {} versions from the index", removed.len());
        }

        // The index no longer references anything below; deletion is
        // best effort and repeated by the next prune.
        let retained_ids: HashSet<&str> = retained.iter().map(String::as_str).collect();
        self.delete_orphan_manifests(&retained_ids).await?;
        let blobs_deleted = self.collect_blobs(&retained).await?;

        Ok(PruneReport {
            removed,
            retained: retained.len(),
            blobs_deleted,
        })
    }

    async fn delete_orphan_manifests(&self, retained: &HashSet<&str>) -> Result<(), DeployError> {
        let index_key = self.layout.index_key();
        for object in self.store.list_objects(&self.layout.versions_prefix()).await? {
            if object.key == index_key {
                continue;
            }
            let Some(version_id) = version_id_of(&self.layout, &object.key) else {
                continue;
            };
            if !retained.contains(version_id) {
                debug!("Deleting manifest {}", object.key);
                if let Err(e) = self.store.delete_object(&object.key).await {
                    warn!("Failed to delete {}: {}", object.key, e);
                }
            }
        }
        Ok(())
    }

    async fn collect_blobs(&self, retained: &[String]) -> Result<usize, DeployError> {
        let mut referenced: HashSet<String> = HashSet::new();
        for version_id in retained {
            let version = self.read_manifest(version_id).await?;
            referenced.extend(version.manifest.into_iter().map(|e| e.hash));
        }

        let mut deleted = 0;
        for object in self.store.list_objects(&self.layout.blobs_prefix()).await? {
            let hash = object.key.rsplit('/').next().unwrap_or_default();
            if referenced.contains(hash) {
                continue;
            }
            match self.store.delete_object(&object.key).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete blob {}: {}", object.key, e),
            }
        }
        if deleted > 0 {
            info!("Deleted {} unreferenced blobs", deleted);
        }
        Ok(deleted)
    }
}

/// How many of the newest versions may be kept besides a current version
/// at `current_position`; a current version outside them takes a slot
fn retention_window(current_position: Option<usize>, max_count: usize) -> usize {
    match current_position {
        Some(position) if position >= max_count => max_count - 1,
        _ => max_count,
    }
}

fn retain(
    version: &VersionSummary,
    position: usize,
    current: Option<&str>,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
    max_count: usize,
    floor: usize,
) -> bool {
    if current == Some(version.id.as_str()) {
        return true;
    }
    if position >= max_count {
        return false;
    }
    if position < floor {
        return true;
    }
    now - version.created_at <= max_age
}

fn version_id_of<'a>(layout: &StorageLayout, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(layout.versions_prefix().as_str())?
        .strip_suffix("/manifest.json")
}

/// Drain `tasks`, failing with the first error. Dropping the set part
/// way aborts the rest.
async fn join_all_ok<T: Send + 'static>(
    mut tasks: JoinSet<Result<T, DeployError>>,
) -> Result<Vec<T>, DeployError> {
    let mut results = Vec::with_capacity(tasks.len());
    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(value)) => results.push(value),
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(DeployError::Internal(format!("task failed: {e}")));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}
