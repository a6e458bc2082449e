//! Object store and CDN capabilities
//!
//! The pipeline talks to its two shared resources through these traits only.
//! Adapters classify every failure into the [`DeployError`] taxonomy so that
//! retry decisions can be made without knowing which provider is behind them.

pub mod cloudfront;
pub mod fs;
pub mod local_cdn;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::models::invalidation::InvalidationStatus;

/// Headers attached to an uploaded object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeaders {
    pub cache_control: Option<String>,
    pub content_type: Option<String>,
}

impl ObjectHeaders {
    pub fn new(cache_control: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            cache_control: Some(cache_control.into()),
            content_type: Some(content_type.into()),
        }
    }

    /// Headers for JSON state documents
    pub fn json() -> Self {
        Self::new("no-cache", "application/json")
    }
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// Result of a metadata lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub headers: ObjectHeaders,
    pub size: u64,
    pub etag: Option<String>,
}

/// An object body together with the ETag it was read at
#[derive(Debug, Clone)]
pub struct VersionedObject {
    pub body: Bytes,
    pub etag: String,
}

/// Condition for a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Only create; fail if the key exists
    DoesNotExist,
    /// Only overwrite the object at this ETag
    Matches(String),
}

/// Object store capability
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location, for logs
    fn describe(&self) -> String;

    /// Verify credentials and reachability
    async fn check(&self) -> Result<(), DeployError>;

    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        headers: &ObjectHeaders,
    ) -> Result<(), DeployError>;

    /// Conditional write. Fails with `PreconditionFailed` when the condition
    /// does not hold. Returns the new ETag.
    async fn put_object_if(
        &self,
        key: &str,
        body: Bytes,
        headers: &ObjectHeaders,
        precondition: Precondition,
    ) -> Result<String, DeployError>;

    /// Read an object. Fails with `NotFound` when absent.
    async fn get_object(&self, key: &str) -> Result<VersionedObject, DeployError>;

    /// List every object under `prefix`, with keys relative to the store root
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>, DeployError>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> Result<(), DeployError>;

    /// Fails with `NotFound` when absent
    async fn get_object_metadata(&self, key: &str) -> Result<ObjectMetadata, DeployError>;
}

/// Read an object, mapping `NotFound` to `None`
pub async fn get_optional(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Option<VersionedObject>, DeployError> {
    match store.get_object(key).await {
        Ok(object) => Ok(Some(object)),
        Err(DeployError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// An invalidation as the CDN reports it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdnInvalidation {
    pub id: String,
    pub status: InvalidationStatus,
    pub created_at: Option<DateTime<Utc>>,
}

/// CDN capability
#[async_trait]
pub trait Cdn: Send + Sync {
    /// Verify credentials and that the distribution exists
    async fn check(&self, distribution_id: &str) -> Result<(), DeployError>;

    /// Submit an invalidation. Resubmitting with the same caller reference
    /// and paths must not create a second invalidation.
    async fn create_invalidation(
        &self,
        distribution_id: &str,
        patterns: &[String],
        caller_ref: &str,
    ) -> Result<String, DeployError>;

    async fn get_invalidation_status(
        &self,
        distribution_id: &str,
        invalidation_id: &str,
    ) -> Result<InvalidationStatus, DeployError>;

    /// Most recent invalidations first
    async fn list_invalidations(
        &self,
        distribution_id: &str,
        limit: usize,
    ) -> Result<Vec<CdnInvalidation>, DeployError>;
}

/// Classify an HTTP status returned by a provider
pub fn classify_status(status: u16, context: String) -> DeployError {
    match status {
        401 | 403 => DeployError::Environment(context),
        404 => DeployError::NotFound(context),
        409 | 412 => DeployError::PreconditionFailed(context),
        429 | 500..=599 => DeployError::TransientProvider(context),
        _ => DeployError::Provider(context),
    }
}

/// Classify a provider error code (`SlowDown`, `AccessDenied`, ...)
pub fn classify_code(code: &str, context: String) -> Option<DeployError> {
    match code {
        "SlowDown" | "Throttling" | "ThrottlingException" | "TooManyRequests"
        | "RequestTimeout" | "ServiceUnavailable" | "InternalError"
        | "TooManyInvalidationsInProgress" => Some(DeployError::TransientProvider(context)),
        "AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken"
        | "InvalidClientTokenId" | "NoSuchBucket" | "NoSuchDistribution" => {
            Some(DeployError::Environment(context))
        }
        "NoSuchKey" | "NotFound" | "NoSuchInvalidation" => Some(DeployError::NotFound(context)),
        "PreconditionFailed" | "ConditionalRequestConflict" => {
            Some(DeployError::PreconditionFailed(context))
        }
        _ => None,
    }
}
