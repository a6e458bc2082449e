//! CloudFront CDN using the AWS SDK

use async_trait::async_trait;
use aws_sdk_cloudfront::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_cloudfront::types::{InvalidationBatch, Paths};
use aws_sdk_cloudfront::Client;
use chrono::DateTime;
use tracing::debug;

use super::s3::load_sdk_config;
use super::{classify_code, classify_status, Cdn, CdnInvalidation};
use crate::errors::DeployError;
use crate::models::invalidation::InvalidationStatus;
use crate::storage::settings::StaticCredentials;

/// CloudFront distribution client
pub struct CloudFrontCdn {
    client: Client,
}

impl CloudFrontCdn {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(region: &str, credentials: Option<&StaticCredentials>) -> Self {
        let sdk_config = load_sdk_config(region, credentials).await;
        Self::new(Client::new(&sdk_config))
    }
}

fn map_error<E>(err: SdkError<E>, context: &str) -> DeployError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = format!("{context}: {}", DisplayErrorContext(&err));

    if let Some(mapped) = err.code().and_then(|code| classify_code(code, message.clone())) {
        return mapped;
    }
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            return DeployError::TransientProvider(message);
        }
        _ => {}
    }
    match err.raw_response().map(|r| r.status().as_u16()) {
        Some(status) => classify_status(status, message),
        None => DeployError::Provider(message),
    }
}

#[async_trait]
impl Cdn for CloudFrontCdn {
    async fn check(&self, distribution_id: &str) -> Result<(), DeployError> {
        self.client
            .get_distribution()
            .id(distribution_id)
            .send()
            .await
            .map_err(|e| {
                DeployError::Environment(format!(
                    "distribution {} is not reachable: {}",
                    distribution_id,
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn create_invalidation(
        &self,
        distribution_id: &str,
        patterns: &[String],
        caller_ref: &str,
    ) -> Result<String, DeployError> {
        debug!(
            "Creating invalidation on {} for {} patterns (ref {})",
            distribution_id,
            patterns.len(),
            caller_ref
        );

        let paths = Paths::builder()
            .quantity(patterns.len() as i32)
            .set_items(Some(patterns.to_vec()))
            .build()
            .map_err(|e| DeployError::Invalidation(format!("invalid path batch: {e}")))?;
        let batch = InvalidationBatch::builder()
            .paths(paths)
            .caller_reference(caller_ref)
            .build()
            .map_err(|e| DeployError::Invalidation(format!("invalid invalidation batch: {e}")))?;

        let output = self
            .client
            .create_invalidation()
            .distribution_id(distribution_id)
            .invalidation_batch(batch)
            .send()
            .await
            .map_err(|e| map_error(e, "create invalidation"))?;

        output
            .invalidation()
            .map(|inv| inv.id().to_string())
            .ok_or_else(|| DeployError::Invalidation("response carried no invalidation".to_string()))
    }

    async fn get_invalidation_status(
        &self,
        distribution_id: &str,
        invalidation_id: &str,
    ) -> Result<InvalidationStatus, DeployError> {
        let output = self
            .client
            .get_invalidation()
            .distribution_id(distribution_id)
            .id(invalidation_id)
            .send()
            .await
            .map_err(|e| map_error(e, &format!("get invalidation {invalidation_id}")))?;

        output
            .invalidation()
            .map(|inv| InvalidationStatus::from_provider(inv.status()))
            .ok_or_else(|| DeployError::NotFound(format!("invalidation {invalidation_id}")))
    }

    async fn list_invalidations(
        &self,
        distribution_id: &str,
        limit: usize,
    ) -> Result<Vec<CdnInvalidation>, DeployError> {
        let output = self
            .client
            .list_invalidations()
            .distribution_id(distribution_id)
            .max_items(limit.min(1_000) as i32)
            .send()
            .await
            .map_err(|e| map_error(e, "list invalidations"))?;

        let items = output
            .invalidation_list()
            .map(|list| list.items())
            .unwrap_or_default();

        Ok(items
            .iter()
            .map(|summary| CdnInvalidation {
                id: summary.id().to_string(),
                status: InvalidationStatus::from_provider(summary.status()),
                created_at: DateTime::from_timestamp(
                    summary.create_time().secs(),
                    summary.create_time().subsec_nanos(),
                ),
            })
            .collect())
    }
}
