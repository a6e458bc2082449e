//! JSON documents in an object store with optimistic concurrency
//!
//! Read-modify-write cycles use the ETag read alongside the document as the
//! write precondition. A concurrent writer makes the write fail with
//! `PreconditionFailed`, after which the cycle is re-run on fresh state.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::errors::DeployError;
use crate::providers::{get_optional, ObjectHeaders, ObjectStore, Precondition};

/// Attempts before a contended update gives up
pub const MAX_CAS_ATTEMPTS: u32 = 5;

/// Read a JSON document, `None` when absent
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<Option<(T, String)>, DeployError> {
    match get_optional(store, key).await? {
        Some(object) => {
            let value = serde_json::from_slice(&object.body)?;
            Ok(Some((value, object.etag)))
        }
        None => Ok(None),
    }
}

/// Write a JSON document under a precondition
pub async fn write_json_if<T: Serialize>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
    precondition: Precondition,
) -> Result<String, DeployError> {
    let body = Bytes::from(serde_json::to_vec_pretty(value)?);
    store
        .put_object_if(key, body, &ObjectHeaders::json(), precondition)
        .await
}

/// Apply `mutate` to the document at `key` and commit it conditionally.
/// A missing document starts from `T::default()`.
pub async fn update_json<T, R, F>(
    store: &dyn ObjectStore,
    key: &str,
    mut mutate: F,
) -> Result<R, DeployError>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnMut(&mut T) -> Result<R, DeployError>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let (mut value, precondition) = match read_json::<T>(store, key).await? {
            Some((value, etag)) => (value, Precondition::Matches(etag)),
            None => (T::default(), Precondition::DoesNotExist),
        };

        let result = mutate(&mut value)?;

        match write_json_if(store, key, &value, precondition).await {
            Ok(_) => return Ok(result),
            Err(DeployError::PreconditionFailed(msg)) if attempt < MAX_CAS_ATTEMPTS => {
                debug!("Concurrent update of {} (attempt {}): {}", key, attempt, msg);
            }
            Err(DeployError::PreconditionFailed(msg)) => {
                return Err(DeployError::PreconditionFailed(format!(
                    "{key} kept changing during update: {msg}"
                )));
            }
            Err(e) => return Err(e),
        }
    }
}
