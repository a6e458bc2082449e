//! Capped invalidation history log
//!
//! Newest first. Updates go through the conditional-write cycle in
//! [`crate::storage::document`] so concurrent writers cannot lose entries.

use std::sync::Arc;

use crate::errors::DeployError;
use crate::models::invalidation::Invalidation;
use crate::providers::ObjectStore;
use crate::storage::document::{read_json, update_json};
use crate::storage::layout::StorageLayout;

#[derive(Clone)]
pub struct InvalidationHistory {
    store: Arc<dyn ObjectStore>,
    key: String,
    cap: usize,
}

impl InvalidationHistory {
    pub fn new(store: Arc<dyn ObjectStore>, layout: &StorageLayout, cap: usize) -> Self {
        Self {
            store,
            key: layout.invalidation_history_key(),
            cap: cap.max(1),
        }
    }

    async fn entries(&self) -> Result<Vec<Invalidation>, DeployError> {
        Ok(read_json::<Vec<Invalidation>>(self.store.as_ref(), &self.key)
            .await?
            .map(|(entries, _)| entries)
            .unwrap_or_default())
    }

    /// Insert or replace by id, dropping the oldest entries past the cap
    pub async fn record(&self, invalidation: &Invalidation) -> Result<(), DeployError> {
        let cap = self.cap;
        update_json(self.store.as_ref(), &self.key, |entries: &mut Vec<Invalidation>| {
            match entries.iter_mut().find(|e| e.id == invalidation.id) {
                Some(existing) => *existing = invalidation.clone(),
                None => entries.insert(0, invalidation.clone()),
            }
            entries.truncate(cap);
            Ok(())
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Invalidation>, DeployError> {
        Ok(self.entries().await?.into_iter().find(|e| e.id == id))
    }

    pub async fn find_by_caller_reference(
        &self,
        caller_reference: &str,
    ) -> Result<Option<Invalidation>, DeployError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .find(|e| e.caller_reference == caller_reference))
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Invalidation>, DeployError> {
        Ok(self.entries().await?.into_iter().take(limit).collect())
    }
}
