//! Deployment pipeline
//!
//! [`DeployContext`] bundles the providers and settings every component is
//! built from. It is constructed once per process and passed down.

pub mod build;
pub mod fsm;
pub mod lease;
pub mod orchestrator;
pub mod preflight;
pub mod records;
pub mod rollback;
pub mod verify;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifacts::store::ArtifactStore;
use crate::errors::DeployError;
use crate::invalidation::executor::InvalidationExecutor;
use crate::invalidation::history::InvalidationHistory;
use crate::invalidation::planner::InvalidationPlanner;
use crate::models::deployment::{Deployment, FailureSummary, PhaseRecord, PhaseStatus, Warning};
use crate::providers::{Cdn, ObjectStore};
use crate::publish::engine::PublishEngine;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

use self::lease::LeaseManager;
use self::records::DeploymentRecords;

/// Providers and settings shared by the pipeline
#[derive(Clone)]
pub struct DeployContext {
    pub settings: Arc<Settings>,
    /// Store the site is served from
    pub site: Arc<dyn ObjectStore>,
    /// Store for versions, history, records and the lease
    pub state: Arc<dyn ObjectStore>,
    pub cdn: Arc<dyn Cdn>,
    pub layout: StorageLayout,
}

impl DeployContext {
    pub fn new(
        settings: Settings,
        site: Arc<dyn ObjectStore>,
        state: Arc<dyn ObjectStore>,
        cdn: Arc<dyn Cdn>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            site,
            state,
            cdn,
            layout: StorageLayout::default(),
        }
    }

    pub fn artifacts(&self, cancel: &CancellationToken) -> ArtifactStore {
        ArtifactStore::new(self.state.clone(), self.layout.clone())
            .with_retry(self.settings.publish.retry.clone())
            .with_concurrency(self.settings.publish.concurrency)
            .with_min_retained(self.settings.retention.min_count)
            .with_cancel(cancel.clone())
    }

    pub fn publisher(&self, cancel: &CancellationToken) -> PublishEngine {
        PublishEngine::new(self.site.clone(), &self.settings.publish).with_cancel(cancel.clone())
    }

    pub fn planner(&self) -> InvalidationPlanner {
        InvalidationPlanner::from_settings(&self.settings.cdn)
    }

    pub fn executor(&self) -> InvalidationExecutor {
        let history = InvalidationHistory::new(
            self.state.clone(),
            &self.layout,
            self.settings.invalidation_history_cap,
        );
        InvalidationExecutor::new(self.cdn.clone(), &self.settings.cdn, history)
    }

    pub fn leases(&self) -> LeaseManager {
        LeaseManager::new(self.state.clone(), &self.layout, &self.settings.lease)
    }

    pub fn records(&self) -> DeploymentRecords {
        DeploymentRecords::new(
            self.state.clone(),
            self.layout.clone(),
            self.settings.deployment_history_cap,
        )
    }
}

/// Run one phase under a hard timeout and append its record
pub(crate) async fn run_phase<T, F>(
    deployment: &mut Deployment,
    name: &str,
    timeout: Duration,
    phase: F,
) -> Result<T, DeployError>
where
    F: Future<Output = Result<T, DeployError>>,
{
    let bounded = async {
        match tokio::time::timeout(timeout, phase).await {
            Ok(result) => result,
            Err(_) => Err(DeployError::Timeout(format!("phase {name} exceeded {timeout:?}"))),
        }
    };
    timed(deployment, name, bounded).await
}

/// Like [`run_phase`] for phases that spawn work. The phase runs on a
/// child of `cancel`; on timeout the child is cancelled and the phase is
/// drained before returning, so none of its tasks outlive it.
pub(crate) async fn run_cancellable_phase<T, F, Fut>(
    deployment: &mut Deployment,
    name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    phase: F,
) -> Result<T, DeployError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, DeployError>>,
{
    let token = cancel.child_token();
    let work = phase(token.clone());
    let bounded = async {
        tokio::pin!(work);
        tokio::select! {
            result = &mut work => result,
            _ = tokio::time::sleep(timeout) => {
                warn!("Phase {} exceeded {:?}; cancelling", name, timeout);
                token.cancel();
                if let Err(e) = (&mut work).await {
                    debug!("Phase {} drained: {}", name, e);
                }
                Err(DeployError::Timeout(format!("phase {name} exceeded {timeout:?}")))
            }
        }
    };
    timed(deployment, name, bounded).await
}

async fn timed<T, F>(deployment: &mut Deployment, name: &str, phase: F) -> Result<T, DeployError>
where
    F: Future<Output = Result<T, DeployError>>,
{
    info!("Phase {} started", name);
    let started = Instant::now();
    let result = phase.await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match &result {
        Ok(_) => {
            info!("Phase {} finished in {} ms", name, duration_ms);
            record_phase(deployment, name, PhaseStatus::Success, duration_ms, None);
        }
        Err(e) => {
            error!("Phase {} failed after {} ms: {}", name, duration_ms, e);
            record_phase(deployment, name, PhaseStatus::Failed, duration_ms, Some(e.to_string()));
        }
    }
    result
}

pub(crate) fn record_phase(
    deployment: &mut Deployment,
    name: &str,
    status: PhaseStatus,
    duration_ms: u64,
    error: Option<String>,
) {
    deployment.phases.push(PhaseRecord {
        name: name.to_string(),
        status,
        duration_ms,
        error,
    });
}

/// Record a consistency warning; the deployment still succeeds
pub(crate) fn add_warning(deployment: &mut Deployment, phase: &str, message: impl Into<String>) {
    deployment.warnings.push(Warning {
        phase: phase.to_string(),
        message: message.into(),
    });
}

pub(crate) fn failure_summary(phase: &str, err: &DeployError) -> FailureSummary {
    FailureSummary {
        phase: phase.to_string(),
        kind: err.kind().to_string(),
        message: err.to_string(),
    }
}
