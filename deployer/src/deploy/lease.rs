//! Advisory deployment lease
//!
//! A lock object in the state store, created with a create-only write and
//! carrying an expiry. An expired lease may be taken over with a write
//! conditioned on the ETag it was read at, so two contenders cannot both
//! win. The orchestrator runs as a fresh process per invocation; nothing
//! here relies on in-process state.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::DeployError;
use crate::providers::{ObjectStore, Precondition};
use crate::storage::document::{read_json, write_json_if};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::LeaseSettings;

/// Contents of the lock object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Deployment id holding the lease
    pub holder: String,
    /// Process description, for operators
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A lease this process holds
#[derive(Debug, Clone)]
pub struct Lease {
    record: LeaseRecord,
    etag: String,
}

impl Lease {
    pub fn holder(&self) -> &str {
        &self.record.holder
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.record.expires_at
    }
}

/// Acquires and releases the lease for one site
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn ObjectStore>,
    key: String,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn ObjectStore>, layout: &StorageLayout, settings: &LeaseSettings) -> Self {
        Self {
            store,
            key: layout.lease_key(&settings.name),
            ttl: Duration::seconds(settings.ttl_secs as i64),
        }
    }

    fn record_for(&self, holder: &str, now: DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            holder: holder.to_string(),
            owner: format!("site-deploy pid {}", std::process::id()),
            acquired_at: now,
            expires_at: now + self.ttl,
        }
    }

    /// Acquire the lease for `holder`. Fails fast with
    /// `ConcurrentDeployment` when a live lease exists.
    pub async fn acquire(&self, holder: &str) -> Result<Lease, DeployError> {
        let now = Utc::now();
        let record = self.record_for(holder, now);

        match write_json_if(self.store.as_ref(), &self.key, &record, Precondition::DoesNotExist).await {
            Ok(etag) => {
                info!("Acquired lease {} for {}", self.key, holder);
                return Ok(Lease { record, etag });
            }
            Err(DeployError::PreconditionFailed(_)) => {}
            Err(e) => return Err(e),
        }

        let Some((existing, etag)) = read_json::<LeaseRecord>(self.store.as_ref(), &self.key).await?
        else {
            // Released between our write and our read; one more try
            let etag = write_json_if(self.store.as_ref(), &self.key, &record, Precondition::DoesNotExist)
                .await
                .map_err(|e| match e {
                    DeployError::PreconditionFailed(_) => DeployError::ConcurrentDeployment {
                        holder: "unknown".to_string(),
                        expires_at: now + self.ttl,
                    },
                    other => other,
                })?;
            return Ok(Lease { record, etag });
        };

        if !existing.is_expired(now) {
            return Err(DeployError::ConcurrentDeployment {
                holder: existing.holder,
                expires_at: existing.expires_at,
            });
        }

        warn!(
            "Taking over lease of {} which expired at {}",
            existing.holder, existing.expires_at
        );
        match write_json_if(self.store.as_ref(), &self.key, &record, Precondition::Matches(etag)).await {
            Ok(etag) => Ok(Lease { record, etag }),
            Err(DeployError::PreconditionFailed(_)) => {
                // Someone else took it over first
                let holder = read_json::<LeaseRecord>(self.store.as_ref(), &self.key)
                    .await?
                    .map(|(r, _)| (r.holder, r.expires_at));
                let (holder, expires_at) = holder.unwrap_or(("unknown".to_string(), now + self.ttl));
                Err(DeployError::ConcurrentDeployment { holder, expires_at })
            }
            Err(e) => Err(e),
        }
    }

    /// Push the expiry out by one TTL. Fails if the lease was lost.
    pub async fn renew(&self, lease: &mut Lease) -> Result<(), DeployError> {
        let mut record = lease.record.clone();
        record.expires_at = Utc::now() + self.ttl;

        match write_json_if(
            self.store.as_ref(),
            &self.key,
            &record,
            Precondition::Matches(lease.etag.clone()),
        )
        .await
        {
            Ok(etag) => {
                lease.record = record;
                lease.etag = etag;
                Ok(())
            }
            Err(DeployError::PreconditionFailed(_)) | Err(DeployError::NotFound(_)) => {
                let current = self.status().await?;
                Err(DeployError::ConcurrentDeployment {
                    holder: current
                        .as_ref()
                        .map(|r| r.holder.clone())
                        .unwrap_or_else(|| "nobody".to_string()),
                    expires_at: current.map(|r| r.expires_at).unwrap_or_else(Utc::now),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Release a lease this process holds. A lease that was meanwhile taken
    /// over is left alone.
    pub async fn release(&self, lease: Lease) -> Result<(), DeployError> {
        match read_json::<LeaseRecord>(self.store.as_ref(), &self.key).await? {
            Some((record, _)) if record.holder == lease.record.holder => {
                self.store.delete_object(&self.key).await?;
                info!("Released lease {} held by {}", self.key, lease.record.holder);
            }
            Some((record, _)) => {
                warn!(
                    "Lease {} is now held by {}; not releasing",
                    self.key, record.holder
                );
            }
            None => warn!("Lease {} was already released", self.key),
        }
        Ok(())
    }

    /// Current lease record, if any
    pub async fn status(&self) -> Result<Option<LeaseRecord>, DeployError> {
        Ok(read_json::<LeaseRecord>(self.store.as_ref(), &self.key)
            .await?
            .map(|(record, _)| record))
    }

    /// Operator release. Without `force` only an expired lease is removed.
    /// Returns the removed record.
    pub async fn release_manually(&self, force: bool) -> Result<Option<LeaseRecord>, DeployError> {
        let Some(record) = self.status().await? else {
            return Ok(None);
        };
        if !force && !record.is_expired(Utc::now()) {
            return Err(DeployError::ConcurrentDeployment {
                holder: record.holder,
                expires_at: record.expires_at,
            });
        }
        self.store.delete_object(&self.key).await?;
        warn!("Lease held by {} removed by operator", record.holder);
        Ok(Some(record))
    }
}
