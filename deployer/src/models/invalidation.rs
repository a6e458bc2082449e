//! Invalidation models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Invalidation status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl InvalidationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvalidationStatus::Completed | InvalidationStatus::Failed)
    }

    /// Map a provider status string (`InProgress`, `Completed`, ...)
    pub fn from_provider(status: &str) -> Self {
        match status.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "completed" | "complete" => InvalidationStatus::Completed,
            "inprogress" => InvalidationStatus::InProgress,
            "failed" | "error" => InvalidationStatus::Failed,
            _ => InvalidationStatus::Pending,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationStatus::Pending => "pending",
            InvalidationStatus::InProgress => "in_progress",
            InvalidationStatus::Completed => "completed",
            InvalidationStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for InvalidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One CDN cache-invalidation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invalidation {
    /// CDN-assigned id
    pub id: String,

    /// Caller reference the request was submitted with
    pub caller_reference: String,

    /// Patterns after optimization
    pub requested_paths: Vec<String>,

    /// Estimated cost in micro-USD
    pub estimated_cost_micros: u64,

    pub status: InvalidationStatus,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Invalidation {
    /// Apply a polled status. Terminal invalidations are never changed.
    pub fn apply_status(&mut self, status: InvalidationStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }
}
