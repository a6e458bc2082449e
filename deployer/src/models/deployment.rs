//! Deployment models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal or running status of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    InProgress,
    Success,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Success => "success",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }
}

/// Kind of run that produced the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentKind {
    Deploy,
    Rollback,
}

/// Status of a single phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Success,
    Failed,
    Skipped,
    Warning,
}

/// One completed phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub name: String,
    pub status: PhaseStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A condition that was recorded without failing the deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub phase: String,
    pub message: String,
}

/// Structured description of the error that failed a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub phase: String,
    pub kind: String,
    pub message: String,
}

/// A single execution of the orchestrator or of a rollback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,

    pub kind: DeploymentKind,

    pub started_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    pub status: DeploymentStatus,

    #[serde(default)]
    pub phases: Vec<PhaseRecord>,

    /// Version captured by this run
    #[serde(default)]
    pub produced_version: Option<String>,

    /// Version restored by a rollback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_version: Option<String>,

    #[serde(default)]
    pub invalidation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub warnings: Vec<Warning>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureSummary>,
}

impl Deployment {
    pub fn new(id: String, kind: DeploymentKind) -> Self {
        Self {
            id,
            kind,
            started_at: Utc::now(),
            finished_at: None,
            status: DeploymentStatus::InProgress,
            phases: Vec::new(),
            produced_version: None,
            restored_version: None,
            invalidation_id: None,
            source_ref: None,
            dry_run: false,
            warnings: Vec::new(),
            failure: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status != DeploymentStatus::InProgress
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|f| (f - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// Entry of the deployments index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub id: String,
    pub kind: DeploymentKind,
    pub status: DeploymentStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub produced_version: Option<String>,
    #[serde(default)]
    pub warning_count: usize,
}

impl From<&Deployment> for DeploymentSummary {
    fn from(d: &Deployment) -> Self {
        Self {
            id: d.id.clone(),
            kind: d.kind,
            status: d.status,
            started_at: d.started_at,
            produced_version: d.produced_version.clone(),
            warning_count: d.warnings.len(),
        }
    }
}
