//! Invalidation submission and polling
//!
//! Submission is idempotent per caller reference: a reference already in
//! the history log returns the recorded invalidation instead of submitting
//! again, and the reference is passed to the CDN, which deduplicates on
//! its side as well.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::invalidation::history::InvalidationHistory;
use crate::invalidation::planner::InvalidationPlan;
use crate::models::invalidation::{Invalidation, InvalidationStatus};
use crate::providers::Cdn;
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::settings::CdnSettings;

pub struct InvalidationExecutor {
    cdn: Arc<dyn Cdn>,
    distribution_id: String,
    history: InvalidationHistory,
    retry: RetryPolicy,
    poll_interval: Duration,
    max_wait: Duration,
}

impl InvalidationExecutor {
    pub fn new(cdn: Arc<dyn Cdn>, settings: &CdnSettings, history: InvalidationHistory) -> Self {
        Self {
            cdn,
            distribution_id: settings.distribution_id.clone(),
            history,
            retry: settings.retry.clone(),
            poll_interval: settings.poll_interval(),
            max_wait: settings.max_wait(),
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn history(&self) -> &InvalidationHistory {
        &self.history
    }

    /// Submit `plan` under `caller_ref`
    pub async fn submit(
        &self,
        plan: &InvalidationPlan,
        caller_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<Invalidation, DeployError> {
        if plan.is_empty() {
            return Err(DeployError::ValidationError(
                "refusing to submit an empty invalidation plan".to_string(),
            ));
        }

        if let Some(existing) = self.history.find_by_caller_reference(caller_ref).await? {
            if existing.requested_paths == plan.patterns {
                info!(
                    "Invalidation for {} already submitted as {}",
                    caller_ref, existing.id
                );
                return Ok(existing);
            }
            return Err(DeployError::Invalidation(format!(
                "caller reference {caller_ref} was already used for different paths"
            )));
        }

        let id = with_retry(&self.retry, "create invalidation", cancel, || {
            self.cdn
                .create_invalidation(&self.distribution_id, &plan.patterns, caller_ref)
        })
        .await
        .map_err(escalate)?;

        let invalidation = Invalidation {
            id,
            caller_reference: caller_ref.to_string(),
            requested_paths: plan.patterns.clone(),
            estimated_cost_micros: plan.estimated_cost_micros,
            status: InvalidationStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        };
        info!(
            "Submitted invalidation {} ({} patterns, ref {})",
            invalidation.id,
            invalidation.requested_paths.len(),
            caller_ref
        );
        self.history.record(&invalidation).await?;
        Ok(invalidation)
    }

    /// Poll until the CDN reports a terminal status or `timeout` elapses.
    /// On timeout the invalidation is returned still in progress.
    pub async fn await_completion(
        &self,
        mut invalidation: Invalidation,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Invalidation, DeployError> {
        let deadline = Instant::now() + timeout;

        loop {
            if invalidation.status.is_terminal() {
                return Ok(invalidation);
            }

            match self.poll(&invalidation.id, cancel).await {
                Ok(status) if status != invalidation.status => {
                    info!("Invalidation {}: {} -> {}", invalidation.id, invalidation.status, status);
                    invalidation.apply_status(status);
                    self.history.record(&invalidation).await?;
                    continue;
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!("Polling invalidation {} failed: {}", invalidation.id, e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Invalidation {} still {} after {:?}",
                    invalidation.id, invalidation.status, timeout
                );
                return Ok(invalidation);
            }

            let wait = self.poll_interval.min(deadline - now);
            debug!("Next poll of {} in {:?}", invalidation.id, wait);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DeployError::Cancelled(format!(
                        "waiting for invalidation {}",
                        invalidation.id
                    )));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn poll(
        &self,
        invalidation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InvalidationStatus, DeployError> {
        with_retry(&self.retry, "get invalidation status", cancel, || {
            self.cdn
                .get_invalidation_status(&self.distribution_id, invalidation_id)
        })
        .await
    }

    /// Refresh one invalidation from the CDN and record the result
    pub async fn refresh(
        &self,
        invalidation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Invalidation, DeployError> {
        let status = self.poll(invalidation_id, cancel).await?;

        match self.history.get(invalidation_id).await? {
            Some(mut invalidation) => {
                invalidation.apply_status(status);
                self.history.record(&invalidation).await?;
                Ok(invalidation)
            }
            // Submitted outside this tool; report what the CDN knows
            None => Ok(Invalidation {
                id: invalidation_id.to_string(),
                caller_reference: String::new(),
                requested_paths: Vec::new(),
                estimated_cost_micros: 0,
                status,
                created_at: Utc::now(),
                completed_at: None,
            }),
        }
    }

    /// Recorded invalidations, newest first
    pub async fn list(&self, limit: usize) -> Result<Vec<Invalidation>, DeployError> {
        self.history.list(limit).await
    }
}

/// Errors that survive retries become invalidation failures
fn escalate(err: DeployError) -> DeployError {
    match err {
        DeployError::Environment(_)
        | DeployError::Cancelled(_)
        | DeployError::Invalidation(_) => err,
        other => DeployError::Invalidation(other.to_string()),
    }
}
