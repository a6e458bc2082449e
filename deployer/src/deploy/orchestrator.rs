//! Deployment orchestrator
//!
//! Drives one run through preflight, build, publish, capture,
//! invalidation, retention and verification while holding the lease.
//! Every phase is timed and recorded; the first hard failure stops the
//! run, and a failed publish can be rolled back to the previous version.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::manifest::Version;
use crate::deploy::build::{detect_source_ref, run_build};
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm};
use crate::deploy::lease::{Lease, LeaseManager};
use crate::deploy::preflight::run_preflight;
use crate::deploy::rollback::RollbackController;
use crate::deploy::verify::{SiteVerifier, VerifyOutcome};
use crate::deploy::{
    add_warning, failure_summary, record_phase, run_cancellable_phase, run_phase, DeployContext,
};
use crate::errors::DeployError;
use crate::invalidation::planner::InvalidationPlan;
use crate::models::deployment::{Deployment, DeploymentKind, DeploymentStatus, PhaseStatus};
use crate::models::invalidation::{Invalidation, InvalidationStatus};
use crate::publish::engine::PublishPlan;
use crate::publish::source::{BuildDirSource, FileSource};
use crate::publish::url_paths;
use crate::utils::{generate_uuid, time_ordered_id};

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Publish the existing build output
    pub skip_build: bool,
    /// Plan only; nothing is written and no lease is taken
    pub dry_run: bool,
    /// Invalidate `/*` instead of the changed paths
    pub aggressive_invalidate: bool,
    /// Overrides the detected git revision
    pub source_ref: Option<String>,
}

/// Result of a run
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    pub deployment: Deployment,
    pub publish_plan: Option<PublishPlan>,
    pub invalidation_plan: Option<InvalidationPlan>,
    pub invalidation: Option<Invalidation>,
}

impl DeployOutcome {
    pub fn succeeded(&self) -> bool {
        self.deployment.status == DeploymentStatus::Success
    }
}

/// A phase failure and where it happened
struct PhaseFailure {
    phase: &'static str,
    error: DeployError,
}

impl PhaseFailure {
    fn new(phase: &'static str, error: DeployError) -> Self {
        Self { phase, error }
    }
}

/// Mutable state of one run
struct Run {
    deployment: Deployment,
    fsm: DeploymentFsm,
    lease: Option<Lease>,
    /// Version current before this run; target of an automatic rollback
    previous_current: Option<String>,
    /// Uploads started; the site may no longer match `current`
    published: bool,
    publish_plan: Option<PublishPlan>,
    invalidation_plan: Option<InvalidationPlan>,
    invalidation: Option<Invalidation>,
}

impl Run {
    fn advance(&mut self, phase: &'static str, event: DeploymentEvent) -> Result<(), PhaseFailure> {
        self.fsm
            .process(event)
            .map_err(|e| PhaseFailure::new(phase, DeployError::Internal(e)))
    }
}

pub struct DeploymentOrchestrator {
    ctx: DeployContext,
    cancel: CancellationToken,
}

impl DeploymentOrchestrator {
    pub fn new(ctx: DeployContext, cancel: CancellationToken) -> Self {
        Self { ctx, cancel }
    }

    /// Execute one deployment. A failed run is reported through the
    /// returned record; `Err` means the run never started (for example,
    /// another deployment holds the lease).
    pub async fn run(&self, options: DeployOptions) -> Result<DeployOutcome, DeployError> {
        let id = time_ordered_id(Utc::now(), &generate_uuid()[..8]);
        let leases = self.ctx.leases();

        let lease = if options.dry_run {
            None
        } else {
            Some(leases.acquire(&id).await?)
        };

        let mut deployment = Deployment::new(id.clone(), DeploymentKind::Deploy);
        deployment.dry_run = options.dry_run;
        if !options.dry_run {
            if let Err(e) = self.ctx.records().begin(&deployment).await {
                warn!("Failed to record deployment {} as started: {}", id, e);
            }
        }
        info!(
            "Deployment {} started{}",
            id,
            if options.dry_run { " (dry run)" } else { "" }
        );

        let mut run = Run {
            deployment,
            fsm: DeploymentFsm::new(),
            lease,
            previous_current: None,
            published: false,
            publish_plan: None,
            invalidation_plan: None,
            invalidation: None,
        };

        if let Err(failure) = self.execute(&options, &leases, &mut run).await {
            self.handle_failure(&options, &mut run, failure).await;
        }

        self.finalize(&options, &leases, run).await
    }

    async fn execute(
        &self,
        options: &DeployOptions,
        leases: &LeaseManager,
        run: &mut Run,
    ) -> Result<(), PhaseFailure> {
        let settings = Arc::clone(&self.ctx.settings);
        let timeout = settings.phase_timeout();

        // Preflight
        run_phase(
            &mut run.deployment,
            "preflight",
            timeout,
            run_preflight(
                &self.ctx.site,
                &self.ctx.state,
                &self.ctx.cdn,
                &settings.cdn.distribution_id,
            ),
        )
        .await
        .map_err(|e| PhaseFailure::new("preflight", e))?;
        run.advance("preflight", DeploymentEvent::PreflightPassed)?;
        self.renew(leases, run).await?;

        // Build
        let build_settings = &settings.build;
        let skip_build = options.skip_build;
        let build = move |token: CancellationToken| async move {
            let output = run_build(build_settings, skip_build, &token).await?;
            BuildDirSource::scan(&output).await
        };
        let source = run_cancellable_phase(&mut run.deployment, "build", timeout, &self.cancel, build)
            .await
            .map_err(|e| PhaseFailure::new("build", e))?;
        let source: Arc<dyn FileSource> = Arc::new(source);
        run.deployment.source_ref = match &options.source_ref {
            Some(source_ref) => Some(source_ref.clone()),
            None => detect_source_ref(&settings.build.working_dir).await,
        };
        run.advance("build", DeploymentEvent::BuildFinished)?;
        self.renew(leases, run).await?;

        // Publish
        let artifacts = self.ctx.artifacts(&self.cancel);
        let previous = self
            .load_previous(run)
            .await
            .map_err(|e| PhaseFailure::new("publish", e))?;
        let publisher = self.ctx.publisher(&self.cancel);
        let plan = publisher.diff(source.as_ref(), previous.as_ref());
        run.publish_plan = Some(plan.clone());

        if options.dry_run {
            let invalidation_plan = self.plan_invalidation(options, &plan.changed_paths());
            info!(
                "Dry run: {} uploads, {} deletions, {} unchanged; invalidation of {} patterns",
                plan.uploads.len(),
                plan.deletions.len(),
                plan.unchanged,
                invalidation_plan.patterns.len()
            );
            run.invalidation_plan = Some(invalidation_plan);
            record_phase(&mut run.deployment, "publish", PhaseStatus::Skipped, 0, None);
            return run.advance("publish", DeploymentEvent::DryRunComplete);
        }

        run.published = true;
        let ctx = &self.ctx;
        let publish = {
            let source = Arc::clone(&source);
            let plan = &plan;
            move |token: CancellationToken| async move {
                ctx.publisher(&token).execute(source, plan).await
            }
        };
        run_cancellable_phase(&mut run.deployment, "publish", timeout, &self.cancel, publish)
            .await
            .map_err(|e| PhaseFailure::new("publish", e))?;
        run.advance("publish", DeploymentEvent::PublishSucceeded)?;
        self.renew(leases, run).await?;

        // Capture
        let source_ref = run.deployment.source_ref.clone();
        let capture = {
            let source = Arc::clone(&source);
            move |token: CancellationToken| async move {
                ctx.artifacts(&token).capture(source, source_ref).await
            }
        };
        let version = run_cancellable_phase(&mut run.deployment, "capture", timeout, &self.cancel, capture)
            .await
            .map_err(|e| PhaseFailure::new("capture", e))?;
        run.deployment.produced_version = Some(version.id.clone());
        self.renew(leases, run).await?;

        // Invalidate
        let invalidation_plan = self.plan_invalidation(options, &plan.changed_paths());
        run.invalidation_plan = Some(invalidation_plan.clone());
        if invalidation_plan.is_empty() {
            info!("No served content changed; skipping invalidation");
            record_phase(&mut run.deployment, "invalidate", PhaseStatus::Skipped, 0, None);
        } else {
            self.invalidate(run, &invalidation_plan).await?;
        }
        run.advance("invalidate", DeploymentEvent::InvalidationHandled)?;
        self.renew(leases, run).await?;

        // Retention
        if settings.retention.prune_after_deploy {
            let started = Instant::now();
            match artifacts
                .prune(settings.retention.max_age(), settings.retention.max_count)
                .await
            {
                Ok(report) => {
                    info!(
                        "Pruned {} versions and {} blobs",
                        report.removed.len(),
                        report.blobs_deleted
                    );
                    record_phase(
                        &mut run.deployment,
                        "prune",
                        PhaseStatus::Success,
                        started.elapsed().as_millis() as u64,
                        None,
                    );
                }
                Err(e) => {
                    warn!("Pruning failed: {}", e);
                    record_phase(
                        &mut run.deployment,
                        "prune",
                        PhaseStatus::Warning,
                        started.elapsed().as_millis() as u64,
                        Some(e.to_string()),
                    );
                    add_warning(&mut run.deployment, "prune", e.to_string());
                }
            }
        }

        // Verify
        self.verify(run).await;
        run.advance("verify", DeploymentEvent::VerificationFinished)?;

        run.advance("complete", DeploymentEvent::Complete)
    }

    /// The manifest to diff against, or `None` to republish everything
    async fn load_previous(&self, run: &mut Run) -> Result<Option<Version>, DeployError> {
        let artifacts = self.ctx.artifacts(&self.cancel);
        let index = artifacts.index().await?;
        run.previous_current = index.current.clone();

        if index.dirty {
            warn!("Last publish did not complete; republishing every file");
            add_warning(
                &mut run.deployment,
                "publish",
                "version index marked dirty; full republish",
            );
            return Ok(None);
        }

        let Some(current) = index.current else {
            info!("No current version; publishing every file");
            return Ok(None);
        };

        match artifacts.get(&current).await {
            Ok(version) => Ok(Some(version)),
            Err(DeployError::NotFound(what)) => {
                warn!("Current version {} is unreadable ({}); republishing every file", current, what);
                add_warning(
                    &mut run.deployment,
                    "publish",
                    format!("manifest of current version {current} is missing; full republish"),
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn plan_invalidation(&self, options: &DeployOptions, changed_paths: &[String]) -> InvalidationPlan {
        let planner = self.ctx.planner();
        if options.aggressive_invalidate {
            planner.full()
        } else {
            planner.plan(&url_paths(changed_paths))
        }
    }

    async fn invalidate(&self, run: &mut Run, plan: &InvalidationPlan) -> Result<(), PhaseFailure> {
        let executor = self.ctx.executor();
        let timeout = self.ctx.settings.phase_timeout();
        let caller_ref = run.deployment.id.clone();

        let submitted = run_phase(
            &mut run.deployment,
            "invalidate",
            timeout,
            executor.submit(plan, &caller_ref, &self.cancel),
        )
        .await
        .map_err(|e| PhaseFailure::new("invalidate", e))?;
        run.deployment.invalidation_id = Some(submitted.id.clone());

        let settled = match executor
            .await_completion(submitted.clone(), executor.max_wait(), &self.cancel)
            .await
        {
            Ok(settled) => settled,
            Err(DeployError::Cancelled(msg)) => {
                return Err(PhaseFailure::new("invalidate", DeployError::Cancelled(msg)));
            }
            Err(e) => {
                add_warning(&mut run.deployment, "invalidate", e.to_string());
                submitted
            }
        };

        match settled.status {
            InvalidationStatus::Completed => {}
            InvalidationStatus::Failed => add_warning(
                &mut run.deployment,
                "invalidate",
                format!("CDN reported invalidation {} as failed", settled.id),
            ),
            status => add_warning(
                &mut run.deployment,
                "invalidate",
                format!("invalidation {} still {} after {:?}", settled.id, status, executor.max_wait()),
            ),
        }
        run.invalidation = Some(settled);
        Ok(())
    }

    async fn verify(&self, run: &mut Run) {
        let started = Instant::now();
        let verifier = match SiteVerifier::new(&self.ctx.settings.verify) {
            Ok(verifier) => verifier,
            Err(e) => {
                add_warning(&mut run.deployment, "verify", e.to_string());
                record_phase(&mut run.deployment, "verify", PhaseStatus::Warning, 0, Some(e.to_string()));
                return;
            }
        };

        let outcome = verifier.verify().await;
        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            VerifyOutcome::Skipped => {
                record_phase(&mut run.deployment, "verify", PhaseStatus::Skipped, duration_ms, None);
            }
            VerifyOutcome::Passed { .. } => {
                record_phase(&mut run.deployment, "verify", PhaseStatus::Success, duration_ms, None);
            }
            VerifyOutcome::Failed(msg) => {
                record_phase(
                    &mut run.deployment,
                    "verify",
                    PhaseStatus::Warning,
                    duration_ms,
                    Some(msg.clone()),
                );
                add_warning(&mut run.deployment, "verify", msg);
            }
        }
    }

    async fn renew(&self, leases: &LeaseManager, run: &mut Run) -> Result<(), PhaseFailure> {
        match run.lease.as_mut() {
            Some(lease) => leases
                .renew(lease)
                .await
                .map_err(|e| PhaseFailure::new("lease", e)),
            None => Ok(()),
        }
    }

    async fn handle_failure(&self, options: &DeployOptions, run: &mut Run, failure: PhaseFailure) {
        let PhaseFailure { phase, error } = failure;
        run.deployment.failure = Some(failure_summary(phase, &error));
        if let Err(e) = run.fsm.process(DeploymentEvent::Fail(error.to_string())) {
            warn!("{}", e);
        }

        if run.published {
            if let Err(mark) = self.ctx.artifacts(&self.cancel).mark_dirty().await {
                warn!("Failed to mark the version index dirty: {}", mark);
            }
        }

        let wants_rollback = phase == "publish"
            && !options.dry_run
            && self.ctx.settings.auto_rollback_on_publish_failure
            && !matches!(error, DeployError::Cancelled(_));
        if !wants_rollback || !run.fsm.can_roll_back() {
            return;
        }

        let Some(target) = run.previous_current.clone() else {
            warn!("Publish failed with no previous version to roll back to");
            add_warning(&mut run.deployment, "rollback", "no previous version to roll back to");
            return;
        };
        let Some(lease) = run.lease.as_mut() else {
            return;
        };

        info!("Rolling back to {} after failed publish", target);
        let failure = run.deployment.failure.clone();
        let controller = RollbackController::new(self.ctx.clone(), self.cancel.clone());
        let caller_ref = format!("{}-rollback", run.deployment.id);
        match controller
            .restore(&target, &caller_ref, &mut run.deployment, lease)
            .await
        {
            Ok(()) => {
                if let Err(e) = run.fsm.process(DeploymentEvent::RollbackCompleted) {
                    warn!("{}", e);
                }
            }
            Err(e) => {
                warn!("Automatic rollback to {} failed: {}", target, e);
                add_warning(
                    &mut run.deployment,
                    "rollback",
                    format!("automatic rollback to {target} failed: {e}"),
                );
            }
        }
        run.deployment.failure = failure;
    }

    async fn finalize(
        &self,
        options: &DeployOptions,
        leases: &LeaseManager,
        run: Run,
    ) -> Result<DeployOutcome, DeployError> {
        let Run {
            mut deployment,
            fsm,
            lease,
            publish_plan,
            invalidation_plan,
            invalidation,
            ..
        } = run;

        deployment.status = match fsm.state().status() {
            DeploymentStatus::InProgress => DeploymentStatus::Failed,
            status => status,
        };
        deployment.finished_at = Some(Utc::now());
        if deployment.status != DeploymentStatus::Success {
            if let Some(version) = deployment.produced_version.take() {
                let phase = match deployment.status {
                    DeploymentStatus::RolledBack => "rollback:snapshot",
                    _ => "capture",
                };
                add_warning(
                    &mut deployment,
                    phase,
                    format!("version {version} stays in history but this run did not succeed"),
                );
            }
        }

        if !options.dry_run {
            if let Err(e) = self.ctx.records().save(&deployment).await {
                warn!("Failed to persist deployment record {}: {}", deployment.id, e);
            }
        }
        if let Some(lease) = lease {
            if let Err(e) = leases.release(lease).await {
                warn!("Failed to release lease: {}", e);
            }
        }

        info!(
            "Deployment {} finished: {} ({} warnings)",
            deployment.id,
            deployment.status.as_str(),
            deployment.warnings.len()
        );
        Ok(DeployOutcome {
            deployment,
            publish_plan,
            invalidation_plan,
            invalidation,
        })
    }
}
