//! Command dispatch

use chrono::Duration;
use tracing::{info, warn};

use crate::app::options::{ArtifactCommand, Command, InvalidateCommand, LeaseCommand};
use crate::app::report::{self, ExitStatus};
use crate::app::state::AppState;
use crate::cache::classifier::CacheClass;
use crate::errors::DeployError;
use crate::invalidation::planner::InvalidationPlan;
use crate::publish::url_paths;
use crate::utils::generate_uuid;

/// Pattern invalidated by `invalidate api`
const API_PATTERN: &str = "/api/*";

/// Run one command against the configured site
pub async fn run(state: &AppState, command: Command) -> Result<ExitStatus, DeployError> {
    match command {
        Command::Deploy(args) => {
            let outcome = state.orchestrator().run(args.into()).await?;
            report::print_deploy_outcome(&outcome);
            Ok(report::exit_status(&outcome.deployment))
        }
        Command::Artifact(cmd) => run_artifact(state, cmd).await,
        Command::Invalidate(cmd) => run_invalidate(state, cmd).await,
        Command::Lease(cmd) => run_lease(state, cmd).await,
        Command::Deployments { limit } => {
            let deployments = state.ctx.records().list(limit).await?;
            report::print_deployments(&deployments);
            Ok(ExitStatus::Success)
        }
        Command::Version => {
            report::print_version_info()?;
            Ok(ExitStatus::Success)
        }
    }
}

async fn run_artifact(state: &AppState, cmd: ArtifactCommand) -> Result<ExitStatus, DeployError> {
    let artifacts = state.ctx.artifacts(&state.cancel);
    match cmd {
        ArtifactCommand::List { limit } => {
            let index = artifacts.index().await?;
            let versions: Vec<_> = index.versions.iter().take(limit).cloned().collect();
            report::print_versions(&versions, index.current.as_deref());
            Ok(ExitStatus::Success)
        }
        ArtifactCommand::Show { version_id } => {
            let version = artifacts.get(&version_id).await?;
            report::print_version(&version);
            Ok(ExitStatus::Success)
        }
        ArtifactCommand::Restore { version_id } => {
            let deployment = state.rollback().rollback(&version_id).await?;
            report::print_deployment(&deployment);
            Ok(report::exit_status(&deployment))
        }
        ArtifactCommand::Prune {
            max_age_days,
            max_count,
        } => {
            let retention = &state.ctx.settings.retention;
            let max_age = max_age_days
                .map(|days| Duration::days(days as i64))
                .unwrap_or_else(|| retention.max_age());
            let max_count = max_count.unwrap_or(retention.max_count);
            if max_count == 0 {
                return Err(DeployError::ValidationError(
                    "--max-count must be at least 1".to_string(),
                ));
            }

            let leases = state.ctx.leases();
            let lease = leases.acquire(&format!("prune-{}", &generate_uuid()[..8])).await?;
            let result = artifacts.prune(max_age, max_count).await;
            if let Err(e) = leases.release(lease).await {
                warn!("Failed to release lease: {}", e);
            }

            report::print_prune(&result?);
            Ok(ExitStatus::Success)
        }
    }
}

async fn run_invalidate(state: &AppState, cmd: InvalidateCommand) -> Result<ExitStatus, DeployError> {
    let executor = state.ctx.executor();
    let planner = state.ctx.planner();

    let plan = match cmd {
        InvalidateCommand::Status { invalidation_id } => {
            let invalidation = executor.refresh(&invalidation_id, &state.cancel).await?;
            report::print_invalidation(&invalidation);
            return Ok(ExitStatus::Success);
        }
        InvalidateCommand::List { limit } => {
            let invalidations = executor.list(limit).await?;
            report::print_invalidations(&invalidations);
            return Ok(ExitStatus::Success);
        }
        InvalidateCommand::Full => planner.full(),
        InvalidateCommand::Api => InvalidationPlan {
            patterns: vec![API_PATTERN.to_string()],
            estimated_cost_micros: planner.cost_model().estimate(1),
            raw_path_count: 1,
        },
        InvalidateCommand::Documents => planner.plan(&current_paths(state, CacheClass::Document).await?),
        InvalidateCommand::Assets => {
            planner.plan(&current_paths(state, CacheClass::ImmutableAsset).await?)
        }
    };

    report::print_invalidation_plan(&plan);
    if plan.is_empty() {
        return Ok(ExitStatus::Success);
    }

    let caller_ref = format!("manual-{}", generate_uuid());
    let invalidation = executor.submit(&plan, &caller_ref, &state.cancel).await?;
    info!("Submitted {}; check with `invalidate status {}`", invalidation.id, invalidation.id);
    report::print_invalidation(&invalidation);
    Ok(ExitStatus::Success)
}

/// URL paths of the current version's files in `class`
async fn current_paths(state: &AppState, class: CacheClass) -> Result<Vec<String>, DeployError> {
    let version = state
        .ctx
        .artifacts(&state.cancel)
        .current()
        .await?
        .ok_or_else(|| DeployError::NotFound("no current version".to_string()))?;

    let paths: Vec<&str> = version
        .manifest
        .iter()
        .filter(|e| e.cache_class == class)
        .map(|e| e.path.as_str())
        .collect();
    Ok(url_paths(&paths))
}

async fn run_lease(state: &AppState, cmd: LeaseCommand) -> Result<ExitStatus, DeployError> {
    let leases = state.ctx.leases();
    match cmd {
        LeaseCommand::Status => {
            let record = leases.status().await?;
            report::print_lease(record.as_ref());
        }
        LeaseCommand::Release { force } => match leases.release_manually(force).await? {
            Some(record) => println!("Released lease held by {}", record.holder),
            None => println!("Lease is free"),
        },
    }
    Ok(ExitStatus::Success)
}
