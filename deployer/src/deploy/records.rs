//! Deployment records
//!
//! A record is written to `deployments/<id>.json` when a run starts and
//! overwritten once when it finalizes; a capped newest-first index lists
//! them.

use std::sync::Arc;

use tracing::debug;

use crate::errors::DeployError;
use crate::models::deployment::{Deployment, DeploymentSummary};
use crate::providers::{ObjectStore, Precondition};
use crate::storage::document::{read_json, update_json, write_json_if};
use crate::storage::layout::StorageLayout;

#[derive(Clone)]
pub struct DeploymentRecords {
    store: Arc<dyn ObjectStore>,
    layout: StorageLayout,
    cap: usize,
}

impl DeploymentRecords {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StorageLayout, cap: usize) -> Self {
        Self {
            store,
            layout,
            cap: cap.max(1),
        }
    }

    /// Record a run as in progress, so a run that dies part way still
    /// leaves a trace
    pub async fn begin(&self, deployment: &Deployment) -> Result<(), DeployError> {
        write_json_if(
            self.store.as_ref(),
            &self.layout.deployment_key(&deployment.id),
            deployment,
            Precondition::DoesNotExist,
        )
        .await?;
        self.index(deployment).await
    }

    /// Persist a finalized deployment over its in-progress record.
    /// A finalized record is never overwritten.
    pub async fn save(&self, deployment: &Deployment) -> Result<(), DeployError> {
        if !deployment.is_finalized() {
            return Err(DeployError::Internal(format!(
                "deployment {} is not finalized",
                deployment.id
            )));
        }

        let key = self.layout.deployment_key(&deployment.id);
        let precondition = match read_json::<Deployment>(self.store.as_ref(), &key).await? {
            Some((existing, _)) if existing.is_finalized() => {
                return Err(DeployError::PreconditionFailed(format!(
                    "deployment {} is already finalized",
                    deployment.id
                )));
            }
            Some((_, etag)) => Precondition::Matches(etag),
            None => Precondition::DoesNotExist,
        };
        write_json_if(self.store.as_ref(), &key, deployment, precondition).await?;
        self.index(deployment).await
    }

    async fn index(&self, deployment: &Deployment) -> Result<(), DeployError> {
        let summary = DeploymentSummary::from(deployment);
        let cap = self.cap;
        let evicted = update_json(
            self.store.as_ref(),
            &self.layout.deployments_index_key(),
            |index: &mut Vec<DeploymentSummary>| {
                match index.iter_mut().find(|d| d.id == summary.id) {
                    Some(existing) => *existing = summary.clone(),
                    None => index.insert(0, summary.clone()),
                }
                Ok(if index.len() > cap {
                    index.split_off(cap)
                } else {
                    Vec::new()
                })
            },
        )
        .await?;

        for old in evicted {
            debug!("Dropping deployment record {}", old.id);
            self.store
                .delete_object(&self.layout.deployment_key(&old.id))
                .await?;
        }
        Ok(())
    }

    pub async fn get(&self, deployment_id: &str) -> Result<Deployment, DeployError> {
        read_json::<Deployment>(self.store.as_ref(), &self.layout.deployment_key(deployment_id))
            .await?
            .map(|(deployment, _)| deployment)
            .ok_or_else(|| DeployError::NotFound(format!("deployment {deployment_id}")))
    }

    /// Newest first
    pub async fn list(&self, limit: usize) -> Result<Vec<DeploymentSummary>, DeployError> {
        Ok(read_json::<Vec<DeploymentSummary>>(
            self.store.as_ref(),
            &self.layout.deployments_index_key(),
        )
        .await?
        .map(|(index, _)| index.into_iter().take(limit).collect())
        .unwrap_or_default())
    }
}
