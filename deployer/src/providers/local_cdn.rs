//! Local CDN stand-in
//!
//! Records invalidations in `<root>/invalidations.json` and reports each one
//! completed the first time its status is polled. Used for local previews.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use super::{Cdn, CdnInvalidation};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::invalidation::InvalidationStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    id: String,
    distribution_id: String,
    caller_reference: String,
    patterns: Vec<String>,
    status: InvalidationStatus,
    created_at: DateTime<Utc>,
}

/// File-backed CDN
pub struct LocalCdn {
    root: PathBuf,
    lock: Mutex<()>,
}

impl LocalCdn {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock: Mutex::new(()),
        }
    }

    fn records_file(&self) -> File {
        File::new(self.root.join("invalidations.json"))
    }

    async fn load(&self) -> Result<Vec<Record>, DeployError> {
        let file = self.records_file();
        if !file.exists().await {
            return Ok(Vec::new());
        }
        file.read_json().await
    }

    async fn save(&self, records: &[Record]) -> Result<(), DeployError> {
        self.records_file().write_json(&records).await
    }
}

#[async_trait]
impl Cdn for LocalCdn {
    async fn check(&self, _distribution_id: &str) -> Result<(), DeployError> {
        Dir::new(&self.root).create().await.map_err(|e| {
            DeployError::Environment(format!("cannot use {}: {}", self.root.display(), e))
        })
    }

    async fn create_invalidation(
        &self,
        distribution_id: &str,
        patterns: &[String],
        caller_ref: &str,
    ) -> Result<String, DeployError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;

        if let Some(existing) = records
            .iter()
            .find(|r| r.distribution_id == distribution_id && r.caller_reference == caller_ref)
        {
            if existing.patterns != patterns {
                return Err(DeployError::PreconditionFailed(format!(
                    "caller reference {caller_ref} was already used with different paths"
                )));
            }
            return Ok(existing.id.clone());
        }

        let id = format!("L{}", uuid::Uuid::new_v4().simple()).to_uppercase();
        info!(
            "Local CDN: invalidating {} patterns on {} ({})",
            patterns.len(),
            distribution_id,
            id
        );
        records.push(Record {
            id: id.clone(),
            distribution_id: distribution_id.to_string(),
            caller_reference: caller_ref.to_string(),
            patterns: patterns.to_vec(),
            status: InvalidationStatus::InProgress,
            created_at: Utc::now(),
        });
        self.save(&records).await?;
        Ok(id)
    }

    async fn get_invalidation_status(
        &self,
        distribution_id: &str,
        invalidation_id: &str,
    ) -> Result<InvalidationStatus, DeployError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;

        let record = records
            .iter_mut()
            .find(|r| r.distribution_id == distribution_id && r.id == invalidation_id)
            .ok_or_else(|| DeployError::NotFound(format!("invalidation {invalidation_id}")))?;

        // Local edges have nothing to purge
        if !record.status.is_terminal() {
            record.status = InvalidationStatus::Completed;
            self.save(&records).await?;
        }
        Ok(InvalidationStatus::Completed)
    }

    async fn list_invalidations(
        &self,
        distribution_id: &str,
        limit: usize,
    ) -> Result<Vec<CdnInvalidation>, DeployError> {
        let records = self.load().await?;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.distribution_id == distribution_id)
            .take(limit)
            .map(|r| CdnInvalidation {
                id: r.id.clone(),
                status: r.status,
                created_at: Some(r.created_at),
            })
            .collect())
    }
}
