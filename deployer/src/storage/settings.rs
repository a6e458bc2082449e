//! Deployment configuration
//!
//! [`Settings`] is read once at process start and passed by reference into
//! every component. Nothing below `main` reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::invalidation::cost::CostModel;
use crate::logs::LogLevel;
use crate::retry::RetryPolicy;

/// Pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily-rolling log files here
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Object store the site is served from
    pub site: StoreSettings,

    /// Backing store for versions, history and the lease
    pub state: StoreSettings,

    /// CDN in front of the site
    pub cdn: CdnSettings,

    #[serde(default)]
    pub build: BuildSettings,

    #[serde(default)]
    pub publish: PublishSettings,

    #[serde(default)]
    pub retention: RetentionSettings,

    #[serde(default)]
    pub lease: LeaseSettings,

    #[serde(default)]
    pub verify: VerifySettings,

    /// Hard timeout for each orchestrator phase, in seconds
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_secs: u64,

    /// Roll back to the current version when a publish fails
    #[serde(default)]
    pub auto_rollback_on_publish_failure: bool,

    #[serde(default = "default_invalidation_history_cap")]
    pub invalidation_history_cap: usize,

    #[serde(default = "default_deployment_history_cap")]
    pub deployment_history_cap: usize,
}

fn default_true() -> bool {
    true
}

fn default_phase_timeout() -> u64 {
    1_800
}

fn default_invalidation_history_cap() -> usize {
    100
}

fn default_deployment_history_cap() -> usize {
    50
}

impl Settings {
    /// Read and validate settings from a JSON file
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        if !file.exists().await {
            return Err(DeployError::ConfigError(format!(
                "settings file not found: {}",
                file.path().display()
            )));
        }
        let settings: Settings = file.read_json().await?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings for a fully local setup rooted at `root`
    pub fn local(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_dir: None,
            site: StoreSettings::Local {
                root: root.join("site"),
            },
            state: StoreSettings::Local {
                root: root.join("state"),
            },
            cdn: CdnSettings {
                provider: CdnProvider::Local {
                    root: root.join("cdn"),
                },
                distribution_id: "local".to_string(),
                path_ceiling: default_path_ceiling(),
                collapse_threshold: default_collapse_threshold(),
                cost: CostModel::default(),
                poll_interval_secs: default_poll_interval(),
                max_wait_secs: default_max_wait(),
                retry: RetryPolicy::default(),
            },
            build: BuildSettings::default(),
            publish: PublishSettings::default(),
            retention: RetentionSettings::default(),
            lease: LeaseSettings::default(),
            verify: VerifySettings::default(),
            phase_timeout_secs: default_phase_timeout(),
            auto_rollback_on_publish_failure: false,
            invalidation_history_cap: default_invalidation_history_cap(),
            deployment_history_cap: default_deployment_history_cap(),
        }
    }

    pub fn validate(&self) -> Result<(), DeployError> {
        self.site.validate("site")?;
        self.state.validate("state")?;
        if self.site.overlaps(&self.state) {
            return Err(DeployError::ConfigError(
                "site and state must not share a location; a rollback would treat state objects as site files"
                    .to_string(),
            ));
        }

        if self.cdn.distribution_id.trim().is_empty() {
            return Err(DeployError::ConfigError(
                "cdn.distribution_id must not be empty".to_string(),
            ));
        }
        if self.cdn.path_ceiling == 0 {
            return Err(DeployError::ConfigError(
                "cdn.path_ceiling must be at least 1".to_string(),
            ));
        }
        if self.cdn.collapse_threshold < 2 {
            return Err(DeployError::ConfigError(
                "cdn.collapse_threshold must be at least 2".to_string(),
            ));
        }
        if self.cdn.cost.overage_rate_micros > self.cdn.cost.base_rate_micros {
            return Err(DeployError::ConfigError(
                "cdn.cost.overage_rate_micros must not exceed base_rate_micros".to_string(),
            ));
        }
        if self.publish.concurrency == 0 {
            return Err(DeployError::ConfigError(
                "publish.concurrency must be at least 1".to_string(),
            ));
        }
        if self.retention.max_count == 0 {
            return Err(DeployError::ConfigError(
                "retention.max_count must be at least 1".to_string(),
            ));
        }
        if let Some(site_url) = &self.verify.site_url {
            url::Url::parse(site_url).map_err(|e| {
                DeployError::ConfigError(format!("verify.site_url is not a valid URL: {e}"))
            })?;
        }
        Ok(())
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }
}

/// Where an object store lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreSettings {
    /// An S3 (or S3-compatible) bucket
    S3 {
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        /// Custom endpoint for S3-compatible services
        #[serde(default)]
        endpoint: Option<String>,
        /// Key prefix applied to every object
        #[serde(default)]
        prefix: Option<String>,
        /// Static credentials; the default AWS chain is used when absent
        #[serde(default)]
        credentials: Option<StaticCredentials>,
    },

    /// A local directory
    Local { root: PathBuf },
}

impl StoreSettings {
    fn validate(&self, section: &str) -> Result<(), DeployError> {
        match self {
            StoreSettings::S3 { bucket, .. } if bucket.trim().is_empty() => Err(
                DeployError::ConfigError(format!("{section}.bucket must not be empty")),
            ),
            StoreSettings::Local { root } if root.as_os_str().is_empty() => Err(
                DeployError::ConfigError(format!("{section}.root must not be empty")),
            ),
            _ => Ok(()),
        }
    }

    /// True when one store's keys could land inside the other's
    pub fn overlaps(&self, other: &StoreSettings) -> bool {
        match (self, other) {
            (
                StoreSettings::S3 {
                    bucket,
                    endpoint,
                    prefix,
                    ..
                },
                StoreSettings::S3 {
                    bucket: other_bucket,
                    endpoint: other_endpoint,
                    prefix: other_prefix,
                    ..
                },
            ) => {
                if bucket != other_bucket || endpoint != other_endpoint {
                    return false;
                }
                let a = normalize_prefix(prefix.as_deref());
                let b = normalize_prefix(other_prefix.as_deref());
                a.starts_with(&b) || b.starts_with(&a)
            }
            (StoreSettings::Local { root }, StoreSettings::Local { root: other_root }) => {
                root.starts_with(other_root) || other_root.starts_with(root)
            }
            _ => false,
        }
    }
}

/// `a/b` and `/a/b/` both become `a/b/`; no prefix is the empty string
fn normalize_prefix(prefix: Option<&str>) -> String {
    let trimmed = prefix.unwrap_or_default().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Static access keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticCredentials {
    pub access_key_id: String,
    #[serde(serialize_with = "redact")]
    pub secret_access_key: SecretString,
}

fn redact<S>(_: &SecretString, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str("[REDACTED]")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// CDN settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdnSettings {
    pub provider: CdnProvider,

    pub distribution_id: String,

    /// Maximum number of patterns in one invalidation
    #[serde(default = "default_path_ceiling")]
    pub path_ceiling: usize,

    /// Changed files in one directory at which it collapses to `dir/*`
    #[serde(default = "default_collapse_threshold")]
    pub collapse_threshold: usize,

    #[serde(default)]
    pub cost: CostModel,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// How long to wait for an invalidation before reporting it in progress
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_path_ceiling() -> usize {
    3_000
}

fn default_collapse_threshold() -> usize {
    5
}

fn default_poll_interval() -> u64 {
    30
}

fn default_max_wait() -> u64 {
    900
}

impl CdnSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// Which CDN is in use
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CdnProvider {
    Cloudfront {
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        credentials: Option<StaticCredentials>,
    },

    /// Invalidations recorded to a local file
    Local { root: PathBuf },
}

/// External build step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Shell command; no build runs when absent
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,

    /// Build output, relative to `working_dir`
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_build_timeout() -> u64 {
    900
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            command: None,
            working_dir: default_working_dir(),
            output_dir: default_output_dir(),
            timeout_secs: default_build_timeout(),
        }
    }
}

impl BuildSettings {
    pub fn output_path(&self) -> PathBuf {
        self.working_dir.join(&self.output_dir)
    }
}

/// Upload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    /// Concurrent uploads
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Delete objects that disappeared from the build
    #[serde(default)]
    pub delete_removed: bool,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_concurrency() -> usize {
    8
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            delete_removed: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Version retention
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,

    #[serde(default = "default_max_count")]
    pub max_count: usize,

    /// Versions kept regardless of age
    #[serde(default = "default_min_count")]
    pub min_count: usize,

    #[serde(default = "default_true")]
    pub prune_after_deploy: bool,
}

fn default_max_age_days() -> u64 {
    30
}

fn default_max_count() -> usize {
    20
}

fn default_min_count() -> usize {
    5
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            max_count: default_max_count(),
            min_count: default_min_count(),
            prune_after_deploy: true,
        }
    }
}

impl RetentionSettings {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.max_age_days as i64)
    }
}

/// Deployment lease
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseSettings {
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,

    /// Lease name; one lease per site/distribution
    #[serde(default = "default_lease_name")]
    pub name: String,
}

fn default_lease_ttl() -> u64 {
    1_800
}

fn default_lease_name() -> String {
    "site".to_string()
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_lease_ttl(),
            name: default_lease_name(),
        }
    }
}

/// Post-deploy verification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerifySettings {
    /// Public URL of the site root; verification is skipped when absent
    #[serde(default)]
    pub site_url: Option<String>,

    #[serde(default = "default_verify_timeout")]
    pub timeout_secs: u64,
}

fn default_verify_timeout() -> u64 {
    15
}
