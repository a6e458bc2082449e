//! Human-readable command output
//!
//! Everything here prints to stdout; logs go to stderr.

use colored::{ColoredString, Colorize};

use crate::artifacts::manifest::{Version, VersionSummary};
use crate::artifacts::store::PruneReport;
use crate::deploy::lease::LeaseRecord;
use crate::deploy::orchestrator::DeployOutcome;
use crate::errors::DeployError;
use crate::invalidation::cost::format_usd;
use crate::invalidation::planner::InvalidationPlan;
use crate::models::deployment::{
    Deployment, DeploymentStatus, DeploymentSummary, FailureSummary, PhaseStatus,
};
use crate::models::invalidation::{Invalidation, InvalidationStatus};
use crate::publish::engine::PublishPlan;
use crate::utils::version_info;

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    /// Succeeded, but something needs an operator's eye
    SuccessWithWarnings,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::SuccessWithWarnings => 2,
        }
    }
}

/// Exit status of a finished deployment or rollback
pub fn exit_status(deployment: &Deployment) -> ExitStatus {
    match deployment.status {
        DeploymentStatus::Success if deployment.has_warnings() => ExitStatus::SuccessWithWarnings,
        DeploymentStatus::Success => ExitStatus::Success,
        DeploymentStatus::RolledBack if deployment.failure.is_none() => {
            if deployment.has_warnings() {
                ExitStatus::SuccessWithWarnings
            } else {
                ExitStatus::Success
            }
        }
        _ => ExitStatus::Failure,
    }
}

fn status_label(status: DeploymentStatus) -> ColoredString {
    match status {
        DeploymentStatus::Success => status.as_str().green().bold(),
        DeploymentStatus::Failed => status.as_str().red().bold(),
        DeploymentStatus::RolledBack => status.as_str().yellow().bold(),
        DeploymentStatus::InProgress => status.as_str().cyan(),
    }
}

fn phase_label(status: PhaseStatus) -> ColoredString {
    match status {
        PhaseStatus::Success => "ok".green(),
        PhaseStatus::Failed => "failed".red(),
        PhaseStatus::Skipped => "skipped".dimmed(),
        PhaseStatus::Warning => "warning".yellow(),
    }
}

fn invalidation_label(status: InvalidationStatus) -> ColoredString {
    match status {
        InvalidationStatus::Completed => status.as_str().green(),
        InvalidationStatus::Failed => status.as_str().red(),
        InvalidationStatus::Pending | InvalidationStatus::InProgress => status.as_str().yellow(),
    }
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn print_version_info() -> Result<(), DeployError> {
    println!("{}", serde_json::to_string_pretty(&version_info())?);
    Ok(())
}

pub fn print_deploy_outcome(outcome: &DeployOutcome) {
    if let Some(plan) = &outcome.publish_plan {
        if outcome.deployment.dry_run {
            print_publish_plan(plan);
        }
    }
    if let Some(plan) = &outcome.invalidation_plan {
        if outcome.deployment.dry_run {
            print_invalidation_plan(plan);
        }
    }
    print_deployment(&outcome.deployment);
}

pub fn print_deployment(deployment: &Deployment) {
    println!();
    println!(
        "{} {} {}",
        "Deployment".bold(),
        deployment.id,
        status_label(deployment.status)
    );
    if deployment.dry_run {
        println!("  {}", "dry run: nothing was published".dimmed());
    }

    println!("  {:<24} {:<8} {:>10}", "PHASE", "STATUS", "DURATION");
    for phase in &deployment.phases {
        println!(
            "  {:<24} {:<8} {:>8}ms",
            phase.name,
            phase_label(phase.status),
            phase.duration_ms
        );
    }

    if let Some(source_ref) = &deployment.source_ref {
        println!("  source:       {}", source_ref);
    }
    if let Some(version) = &deployment.produced_version {
        println!("  version:      {}", version);
    }
    if let Some(version) = &deployment.restored_version {
        println!("  restored:     {}", version);
    }
    if let Some(id) = &deployment.invalidation_id {
        println!("  invalidation: {}", id);
    }
    if let Some(ms) = deployment.duration_ms() {
        println!("  took:         {:.1}s", ms as f64 / 1000.0);
    }

    for warning in &deployment.warnings {
        println!("  {} [{}] {}", "warning".yellow(), warning.phase, warning.message);
    }
    if let Some(failure) = &deployment.failure {
        print_failure(failure);
    }
}

pub fn print_failure(failure: &FailureSummary) {
    println!();
    println!("{}", "Deployment failed".red().bold());
    println!("  phase:   {}", failure.phase);
    println!("  kind:    {}", failure.kind);
    println!("  message: {}", failure.message);
}

/// Summary for an error that stopped a command before it produced a record
pub fn print_error(err: &DeployError) {
    eprintln!("{} [{}] {}", "error".red().bold(), err.kind(), err);
    if let DeployError::ConcurrentDeployment { .. } = err {
        eprintln!("  another deployment is running; `site-deploy lease status` shows the holder");
    }
}

pub fn print_publish_plan(plan: &PublishPlan) {
    println!(
        "{} {} uploads, {} deletions, {} unchanged",
        "Publish plan:".bold(),
        plan.uploads.len(),
        plan.deletions.len(),
        plan.unchanged
    );
    for entry in &plan.uploads {
        println!("  {} {} ({}, {})", "+".green(), entry.path, format_size(entry.size), entry.cache_class);
    }
    for path in &plan.deletions {
        println!("  {} {}", "-".red(), path);
    }
}

pub fn print_invalidation_plan(plan: &InvalidationPlan) {
    if plan.is_empty() {
        println!("{} nothing to invalidate", "Invalidation plan:".bold());
        return;
    }
    println!(
        "{} {} patterns from {} paths, estimated {}",
        "Invalidation plan:".bold(),
        plan.patterns.len(),
        plan.raw_path_count,
        format_usd(plan.estimated_cost_micros)
    );
    for pattern in &plan.patterns {
        println!("  {}", pattern);
    }
}

pub fn print_versions(versions: &[VersionSummary], current: Option<&str>) {
    if versions.is_empty() {
        println!("No versions captured yet");
        return;
    }
    println!("  {:<36} {:<20} {:>7} {:>10}  SOURCE", "VERSION", "CREATED", "FILES", "SIZE");
    for version in versions {
        let marker = if current == Some(version.id.as_str()) {
            "*".green().bold()
        } else {
            " ".normal()
        };
        println!(
            "{} {:<36} {:<20} {:>7} {:>10}  {}",
            marker,
            version.id,
            version.created_at.format("%Y-%m-%d %H:%M:%S"),
            version.file_count,
            format_size(version.total_size),
            version.source_ref.as_deref().unwrap_or("-")
        );
    }
}

pub fn print_version(version: &Version) {
    println!("{} {}", "Version".bold(), version.id);
    println!("  created: {}", version.created_at.to_rfc3339());
    println!("  source:  {}", version.source_ref.as_deref().unwrap_or("-"));
    println!("  files:   {} ({})", version.file_count, format_size(version.total_size));
    for entry in &version.manifest {
        println!(
            "  {:<48} {:>10}  {:<14} {}",
            entry.path,
            format_size(entry.size),
            entry.cache_class.as_str(),
            &entry.hash[..entry.hash.len().min(12)]
        );
    }
}

pub fn print_prune(report: &PruneReport) {
    println!(
        "Pruned {} versions ({} retained, {} blobs deleted)",
        report.removed.len(),
        report.retained,
        report.blobs_deleted
    );
    for id in &report.removed {
        println!("  {} {}", "-".red(), id);
    }
}

pub fn print_invalidation(invalidation: &Invalidation) {
    println!(
        "{} {} {}",
        "Invalidation".bold(),
        invalidation.id,
        invalidation_label(invalidation.status)
    );
    if !invalidation.caller_reference.is_empty() {
        println!("  reference: {}", invalidation.caller_reference);
    }
    println!("  created:   {}", invalidation.created_at.to_rfc3339());
    if let Some(completed_at) = invalidation.completed_at {
        println!("  completed: {}", completed_at.to_rfc3339());
    }
    if !invalidation.requested_paths.is_empty() {
        println!(
            "  cost:      {} for {} patterns",
            format_usd(invalidation.estimated_cost_micros),
            invalidation.requested_paths.len()
        );
        for path in &invalidation.requested_paths {
            println!("    {}", path);
        }
    }
}

pub fn print_invalidations(invalidations: &[Invalidation]) {
    if invalidations.is_empty() {
        println!("No invalidations recorded");
        return;
    }
    for invalidation in invalidations {
        println!(
            "  {:<16} {:<12} {:>5} patterns  {}  {}",
            invalidation.id,
            invalidation_label(invalidation.status),
            invalidation.requested_paths.len(),
            invalidation.created_at.format("%Y-%m-%d %H:%M:%S"),
            invalidation.caller_reference
        );
    }
}

pub fn print_lease(record: Option<&LeaseRecord>) {
    match record {
        None => println!("Lease is free"),
        Some(record) => {
            let state = if record.is_expired(chrono::Utc::now()) {
                "expired".yellow()
            } else {
                "held".red()
            };
            println!("Lease {} by {}", state, record.holder);
            println!("  owner:    {}", record.owner);
            println!("  acquired: {}", record.acquired_at.to_rfc3339());
            println!("  expires:  {}", record.expires_at.to_rfc3339());
        }
    }
}

pub fn print_deployments(deployments: &[DeploymentSummary]) {
    if deployments.is_empty() {
        println!("No deployments recorded");
        return;
    }
    for d in deployments {
        let warnings = if d.warning_count > 0 {
            format!("{} warnings", d.warning_count).yellow()
        } else {
            "".normal()
        };
        println!(
            "  {:<36} {:<9} {:<12} {}  {} {}",
            d.id,
            format!("{:?}", d.kind).to_lowercase(),
            status_label(d.status),
            d.started_at.format("%Y-%m-%d %H:%M:%S"),
            d.produced_version.as_deref().unwrap_or("-"),
            warnings
        );
    }
}
