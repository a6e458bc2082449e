//! Error types for the deployment pipeline

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for the deployment pipeline
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Bad credentials, unreachable store or CDN. Never retried.
    #[error("Environment error: {0}")]
    Environment(String),

    /// Throttling or a 5xx from the store or CDN. Retried with backoff.
    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    #[error("Provider error: {0}")]
    Provider(String),

    /// A conditional write lost against a concurrent writer.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Invalidation error: {0}")]
    Invalidation(String),

    #[error("Another deployment holds the lease ({holder}, expires {expires_at})")]
    ConcurrentDeployment {
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Artifact IO error: {0}")]
    ArtifactIo(String),

    #[error("Build error: {0}")]
    Build(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Whether the operation that produced this error may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            DeployError::TransientProvider(_) => true,
            DeployError::HttpError(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Stable name of the error kind, used in failure summaries
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::IoError(_) => "io",
            DeployError::JsonError(_) => "json",
            DeployError::HttpError(_) => "http",
            DeployError::Environment(_) => "environment",
            DeployError::TransientProvider(_) => "transient_provider",
            DeployError::Provider(_) => "provider",
            DeployError::PreconditionFailed(_) => "precondition_failed",
            DeployError::Publish(_) => "publish",
            DeployError::Invalidation(_) => "invalidation",
            DeployError::ConcurrentDeployment { .. } => "concurrent_deployment",
            DeployError::NotFound(_) => "not_found",
            DeployError::ArtifactIo(_) => "artifact_io",
            DeployError::Build(_) => "build",
            DeployError::ConfigError(_) => "config",
            DeployError::ValidationError(_) => "validation",
            DeployError::Cancelled(_) => "cancelled",
            DeployError::Timeout(_) => "timeout",
            DeployError::Internal(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(format!("{err:#}"))
    }
}
