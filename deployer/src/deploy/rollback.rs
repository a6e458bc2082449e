//! Restoring the site to a captured version
//!
//! The served state is snapshotted first, so every rollback can itself be
//! rolled back. The snapshot doubles as the diff base: files whose content
//! differs from the target are uploaded from the artifact store, files the
//! target does not have are deleted, and the union is invalidated.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm};
use crate::deploy::lease::Lease;
use crate::deploy::{add_warning, failure_summary, run_cancellable_phase, run_phase, DeployContext};
use crate::errors::DeployError;
use crate::models::deployment::{Deployment, DeploymentKind, DeploymentStatus};
use crate::models::invalidation::InvalidationStatus;
use crate::publish::source::{FileSource, VersionSource};
use crate::publish::url_paths;
use crate::utils::{generate_uuid, time_ordered_id};

pub struct RollbackController {
    ctx: DeployContext,
    cancel: CancellationToken,
}

impl RollbackController {
    pub fn new(ctx: DeployContext, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    /// Roll the site back to `version_id` as its own deployment run.
    ///
    /// Fails with `NotFound` before taking the lease when the version is
    /// not in the index. Otherwise the lease is held throughout and the
    /// record is persisted whatever the outcome.
    pub async fn rollback(&self, version_id: &str) -> Result<Deployment, DeployError> {
        self.ctx.artifacts(&self.cancel).get(version_id).await?;

        let id = time_ordered_id(Utc::now(), &generate_uuid()[..8]);
        let leases = self.ctx.leases();
        let mut lease = leases.acquire(&id).await?;

        let mut deployment = Deployment::new(id.clone(), DeploymentKind::Rollback);
        if let Err(e) = self.ctx.records().begin(&deployment).await {
            warn!("Failed to record rollback {} as started: {}", id, e);
        }
        let mut fsm = DeploymentFsm::new();

        let event = match self.restore(version_id, &id, &mut deployment, &mut lease).await {
            Ok(()) => DeploymentEvent::RollbackCompleted,
            Err(e) => DeploymentEvent::Fail(e.to_string()),
        };
        if let Err(e) = fsm.process(event) {
            warn!("{}", e);
        }

        deployment.status = match fsm.state().status() {
            DeploymentStatus::InProgress => DeploymentStatus::Failed,
            status => status,
        };
        deployment.finished_at = Some(Utc::now());
        if deployment.status == DeploymentStatus::Failed {
            if let Some(snapshot) = deployment.produced_version.take() {
                add_warning(
                    &mut deployment,
                    "rollback:snapshot",
                    format!("pre-rollback snapshot {snapshot} stays in history"),
                );
            }
        }

        if let Err(e) = self.ctx.records().save(&deployment).await {
            warn!("Failed to persist deployment record {}: {}", deployment.id, e);
        }
        if let Err(e) = leases.release(lease).await {
            warn!("Failed to release lease: {}", e);
        }
        Ok(deployment)
    }

    /// Restore `version_id` onto the site, recording phases on
    /// `deployment`. The caller holds `lease`, which is renewed between
    /// phases. On failure the error is also recorded as the deployment's
    /// failure summary.
    pub async fn restore(
        &self,
        version_id: &str,
        caller_ref: &str,
        deployment: &mut Deployment,
        lease: &mut Lease,
    ) -> Result<(), DeployError> {
        let timeout = self.ctx.settings.phase_timeout();
        let artifacts = self.ctx.artifacts(&self.cancel);
        deployment.restored_version = Some(version_id.to_string());

        let target = match run_phase(deployment, "rollback:resolve", timeout, artifacts.get(version_id)).await {
            Ok(target) => target,
            Err(e) => return Err(fail(deployment, "rollback:resolve", e)),
        };
        self.renew(lease, deployment).await?;

        let ctx = &self.ctx;
        let snapshot = run_cancellable_phase(
            deployment,
            "rollback:snapshot",
            timeout,
            &self.cancel,
            |token| async move { ctx.artifacts(&token).snapshot(ctx.site.clone()).await },
        )
        .await;
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(fail(deployment, "rollback:snapshot", e)),
        };
        deployment.produced_version = Some(snapshot.id.clone());
        self.renew(lease, deployment).await?;

        let source: Arc<dyn FileSource> = Arc::new(VersionSource::new(artifacts.clone(), target));
        let plan = self
            .ctx
            .publisher(&self.cancel)
            .with_delete_removed(true)
            .diff(source.as_ref(), Some(&snapshot));
        info!(
            "Rolling back to {}: {} files to restore, {} to delete",
            version_id,
            plan.uploads.len(),
            plan.deletions.len()
        );

        // From here on the site may match neither version until activation
        let plan_ref = &plan;
        let restored = run_cancellable_phase(
            deployment,
            "rollback:restore",
            timeout,
            &self.cancel,
            |token| async move {
                ctx.publisher(&token)
                    .with_delete_removed(true)
                    .execute(source, plan_ref)
                    .await
            },
        )
        .await;
        let report = match restored {
            Ok(report) => report,
            Err(e) => return Err(self.fail_dirty(deployment, "rollback:restore", e).await),
        };
        if let Err(e) = self.ctx.leases().renew(lease).await {
            return Err(self.fail_dirty(deployment, "rollback:lease", e).await);
        }

        if let Err(e) = run_phase(deployment, "rollback:activate", timeout, artifacts.set_current(version_id)).await {
            return Err(self.fail_dirty(deployment, "rollback:activate", e).await);
        }
        self.renew(lease, deployment).await?;

        let invalidation_plan = self.ctx.planner().plan(&url_paths(&report.changed_paths));
        if invalidation_plan.is_empty() {
            info!("Site already matched {}; nothing to invalidate", version_id);
            return Ok(());
        }

        let executor = self.ctx.executor();
        let invalidation = match run_phase(
            deployment,
            "rollback:invalidate",
            timeout,
            executor.submit(&invalidation_plan, caller_ref, &self.cancel),
        )
        .await
        {
            Ok(invalidation) => invalidation,
            Err(e) => return Err(fail(deployment, "rollback:invalidate", e)),
        };
        deployment.invalidation_id = Some(invalidation.id.clone());
        self.renew(lease, deployment).await?;

        match executor
            .await_completion(invalidation, executor.max_wait(), &self.cancel)
            .await
        {
            Ok(done) if done.status == InvalidationStatus::Completed => {}
            Ok(pending) => add_warning(
                deployment,
                "rollback:invalidate",
                format!("invalidation {} is {}", pending.id, pending.status),
            ),
            Err(e) => add_warning(deployment, "rollback:invalidate", e.to_string()),
        }

        info!("Rolled back to {}", version_id);
        Ok(())
    }

    async fn renew(&self, lease: &mut Lease, deployment: &mut Deployment) -> Result<(), DeployError> {
        self.ctx
            .leases()
            .renew(lease)
            .await
            .map_err(|e| fail(deployment, "rollback:lease", e))
    }

    /// Fail after the site store was touched: `current` no longer
    /// describes what is served
    async fn fail_dirty(&self, deployment: &mut Deployment, phase: &str, err: DeployError) -> DeployError {
        if let Err(mark) = self.ctx.artifacts(&self.cancel).mark_dirty().await {
            warn!("Failed to mark the version index dirty: {}", mark);
        }
        fail(deployment, phase, err)
    }
}

fn fail(deployment: &mut Deployment, phase: &str, err: DeployError) -> DeployError {
    deployment.failure = Some(failure_summary(phase, &err));
    err
}
