//! Shared in-memory fakes for the integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use site_deployer::deploy::DeployContext;
use site_deployer::errors::DeployError;
use site_deployer::models::invalidation::InvalidationStatus;
use site_deployer::providers::{
    Cdn, CdnInvalidation, ObjectHeaders, ObjectMetadata, ObjectStore, ObjectSummary, Precondition,
    VersionedObject,
};
use site_deployer::retry::RetryPolicy;
use site_deployer::storage::settings::{BuildSettings, Settings};

// ================================ OBJECT STORE =================================== //

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    headers: ObjectHeaders,
    etag: String,
}

#[derive(Debug, Default)]
struct Faults {
    /// Key -> remaining transient failures
    transient: HashMap<String, u32>,
    /// Keys whose writes always fail
    fatal: HashSet<String>,
    /// Writes allowed before every further write fails
    crash_after: Option<usize>,
    unreachable: bool,
    /// Every write waits this long first
    write_delay: Option<Duration>,
}

/// Object store kept in memory, with conditional writes and fault injection
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    faults: Mutex<Faults>,
    writes_by_key: Mutex<HashMap<String, u64>>,
    puts: AtomicU64,
    next_etag: AtomicU64,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `times` writes of `key` fail with a transient error
    pub fn fail_transiently(&self, key: &str, times: u32) {
        self.faults.lock().unwrap().transient.insert(key.to_string(), times);
    }

    /// Every write of `key` fails with a non-retryable error
    pub fn fail_fatally(&self, key: &str) {
        self.faults.lock().unwrap().fatal.insert(key.to_string());
    }

    /// After `puts` more successful writes, every write fails
    pub fn crash_after_puts(&self, puts: usize) {
        self.faults.lock().unwrap().crash_after = Some(self.put_count() as usize + puts);
    }

    pub fn delay_writes(&self, delay: Duration) {
        self.faults.lock().unwrap().write_delay = Some(delay);
    }

    pub fn set_unreachable(&self) {
        self.faults.lock().unwrap().unreachable = true;
    }

    pub fn heal(&self) {
        *self.faults.lock().unwrap() = Faults::default();
    }

    /// Successful writes so far
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Successful writes of `key` so far
    pub fn writes_of(&self, key: &str) -> u64 {
        self.writes_by_key.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        self.keys().into_iter().filter(|k| k.starts_with(prefix)).collect()
    }

    pub fn body(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| String::from_utf8_lossy(&o.body).into_owned())
    }

    pub fn headers(&self, key: &str) -> Option<ObjectHeaders> {
        self.objects.lock().unwrap().get(key).map(|o| o.headers.clone())
    }

    /// Overwrite an object behind the pipeline's back
    pub fn insert(&self, key: &str, body: &str) {
        let etag = self.new_etag();
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body: Bytes::from(body.to_string()),
                headers: ObjectHeaders::default(),
                etag,
            },
        );
    }

    fn new_etag(&self) -> String {
        format!("\"etag-{}\"", self.next_etag.fetch_add(1, Ordering::SeqCst))
    }

    fn check_write_faults(&self, key: &str) -> Result<(), DeployError> {
        let mut faults = self.faults.lock().unwrap();
        if faults.unreachable {
            return Err(DeployError::Environment("store unreachable".to_string()));
        }
        if let Some(limit) = faults.crash_after {
            if self.puts.load(Ordering::SeqCst) as usize >= limit {
                return Err(DeployError::Provider(format!("crashed before writing {key}")));
            }
        }
        if faults.fatal.contains(key) {
            return Err(DeployError::Provider(format!("write of {key} rejected")));
        }
        if let Some(remaining) = faults.transient.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DeployError::TransientProvider(format!("503 writing {key}")));
            }
        }
        Ok(())
    }

    fn write(&self, key: &str, body: Bytes, headers: &ObjectHeaders) -> String {
        let etag = self.new_etag();
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body,
                headers: headers.clone(),
                etag: etag.clone(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        *self.writes_by_key.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
        etag
    }

    async fn wait_before_write(&self) {
        let delay = self.faults.lock().unwrap().write_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn check(&self) -> Result<(), DeployError> {
        if self.faults.lock().unwrap().unreachable {
            return Err(DeployError::Environment("store unreachable".to_string()));
        }
        Ok(())
    }

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        headers: &ObjectHeaders,
    ) -> Result<(), DeployError> {
        self.wait_before_write().await;
        self.check_write_faults(key)?;
        self.write(key, body, headers);
        Ok(())
    }

    async fn put_object_if(
        &self,
        key: &str,
        body: Bytes,
        headers: &ObjectHeaders,
        precondition: Precondition,
    ) -> Result<String, DeployError> {
        self.wait_before_write().await;
        self.check_write_faults(key)?;
        let current = self.objects.lock().unwrap().get(key).map(|o| o.etag.clone());
        let holds = match (&precondition, current) {
            (Precondition::DoesNotExist, None) => true,
            (Precondition::Matches(expected), Some(actual)) => *expected == actual,
            _ => false,
        };
        if !holds {
            return Err(DeployError::PreconditionFailed(format!("{key}: {precondition:?}")));
        }
        Ok(self.write(key, body, headers))
    }

    async fn get_object(&self, key: &str) -> Result<VersionedObject, DeployError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| VersionedObject {
                body: o.body.clone(),
                etag: o.etag.clone(),
            })
            .ok_or_else(|| DeployError::NotFound(key.to_string()))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>, DeployError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, o)| ObjectSummary {
                key: key.clone(),
                size: o.body.len() as u64,
            })
            .collect())
    }

    async fn delete_object(&self, key: &str) -> Result<(), DeployError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn get_object_metadata(&self, key: &str) -> Result<ObjectMetadata, DeployError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| ObjectMetadata {
                headers: o.headers.clone(),
                size: o.body.len() as u64,
                etag: Some(o.etag.clone()),
            })
            .ok_or_else(|| DeployError::NotFound(key.to_string()))
    }
}

// ===================================== CDN ======================================= //

#[derive(Debug)]
struct CdnState {
    /// Status reported on the n-th poll of an invalidation; the last repeats
    script: Vec<InvalidationStatus>,
    by_reference: HashMap<String, (String, Vec<String>)>,
    polls: HashMap<String, usize>,
    submissions: Vec<Vec<String>>,
    transient_creates: u32,
}

/// CDN whose invalidations follow a scripted status progression
#[derive(Debug)]
pub struct MockCdn {
    state: Mutex<CdnState>,
}

impl MockCdn {
    /// Invalidations report in progress, then complete
    pub fn new() -> Arc<Self> {
        Self::scripted(vec![InvalidationStatus::InProgress, InvalidationStatus::Completed])
    }

    /// Invalidations never leave in progress
    pub fn never_completes() -> Arc<Self> {
        Self::scripted(vec![InvalidationStatus::InProgress])
    }

    pub fn scripted(script: Vec<InvalidationStatus>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CdnState {
                script,
                by_reference: HashMap::new(),
                polls: HashMap::new(),
                submissions: Vec::new(),
                transient_creates: 0,
            }),
        })
    }

    /// The next `times` submissions fail with throttling
    pub fn throttle_creates(&self, times: u32) {
        self.state.lock().unwrap().transient_creates = times;
    }

    /// Invalidations actually created, in order
    pub fn submissions(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().submissions.clone()
    }
}

#[async_trait]
impl Cdn for MockCdn {
    async fn check(&self, _distribution_id: &str) -> Result<(), DeployError> {
        Ok(())
    }

    async fn create_invalidation(
        &self,
        _distribution_id: &str,
        patterns: &[String],
        caller_ref: &str,
    ) -> Result<String, DeployError> {
        let mut state = self.state.lock().unwrap();
        if state.transient_creates > 0 {
            state.transient_creates -= 1;
            return Err(DeployError::TransientProvider("TooManyInvalidationsInProgress".to_string()));
        }
        if let Some((id, existing)) = state.by_reference.get(caller_ref) {
            if existing.as_slice() != patterns {
                return Err(DeployError::PreconditionFailed(format!(
                    "caller reference {caller_ref} reused"
                )));
            }
            return Ok(id.clone());
        }
        let id = format!("I{:04}", state.submissions.len() + 1);
        state
            .by_reference
            .insert(caller_ref.to_string(), (id.clone(), patterns.to_vec()));
        state.submissions.push(patterns.to_vec());
        Ok(id)
    }

    async fn get_invalidation_status(
        &self,
        _distribution_id: &str,
        invalidation_id: &str,
    ) -> Result<InvalidationStatus, DeployError> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if !state.by_reference.values().any(|(id, _)| id == invalidation_id) {
            return Err(DeployError::NotFound(invalidation_id.to_string()));
        }
        let polls = state.polls.entry(invalidation_id.to_string()).or_insert(0);
        let index = (*polls).min(state.script.len() - 1);
        *polls += 1;
        Ok(state.script[index])
    }

    async fn list_invalidations(
        &self,
        _distribution_id: &str,
        limit: usize,
    ) -> Result<Vec<CdnInvalidation>, DeployError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .by_reference
            .values()
            .take(limit)
            .map(|(id, _)| CdnInvalidation {
                id: id.clone(),
                status: InvalidationStatus::InProgress,
                created_at: Some(Utc::now()),
            })
            .collect())
    }
}

// =================================== HARNESS ===================================== //

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 4,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

/// Settings for tests: builds read `<root>/dist`, retries are fast
pub fn test_settings(root: &Path) -> Settings {
    let mut settings = Settings::local(root);
    settings.build = BuildSettings {
        command: None,
        working_dir: root.to_path_buf(),
        output_dir: PathBuf::from("dist"),
        timeout_secs: 60,
    };
    settings.publish.retry = fast_retry();
    settings.cdn.retry = fast_retry();
    settings.cdn.poll_interval_secs = 1;
    settings.cdn.max_wait_secs = 30;
    settings.retention.prune_after_deploy = false;
    settings.phase_timeout_secs = 60;
    settings
}

/// Stores, CDN and a scratch build directory wired into a context
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub site: Arc<MemoryObjectStore>,
    pub state: Arc<MemoryObjectStore>,
    pub cdn: Arc<MockCdn>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_cdn(MockCdn::new())
    }

    pub fn with_cdn(cdn: Arc<MockCdn>) -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            site: MemoryObjectStore::new(),
            state: MemoryObjectStore::new(),
            cdn,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn build_dir(&self) -> PathBuf {
        self.dir.path().join("dist")
    }

    pub fn settings(&self) -> Settings {
        test_settings(self.root())
    }

    pub fn context(&self) -> DeployContext {
        self.context_with(self.settings())
    }

    pub fn context_with(&self, settings: Settings) -> DeployContext {
        DeployContext::new(settings, self.site.clone(), self.state.clone(), self.cdn.clone())
    }

    /// Replace the build output with `files`
    pub fn write_build(&self, files: &[(&str, &str)]) {
        write_tree(&self.build_dir(), files);
    }
}

/// Replace the contents of `root` with `files`
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    if root.exists() {
        std::fs::remove_dir_all(root).unwrap();
    }
    for (path, contents) in files {
        let path = root.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
}
