//! Pre-flight checks
//!
//! Verifies that the site store, the state store and the CDN distribution
//! are reachable with the configured credentials. Every failure here is an
//! environment problem and is never retried.

use std::sync::Arc;

use tracing::info;

use crate::errors::DeployError;
use crate::providers::{Cdn, ObjectStore};

pub async fn run_preflight(
    site: &Arc<dyn ObjectStore>,
    state: &Arc<dyn ObjectStore>,
    cdn: &Arc<dyn Cdn>,
    distribution_id: &str,
) -> Result<(), DeployError> {
    let (site_check, state_check, cdn_check) =
        tokio::join!(site.check(), state.check(), cdn.check(distribution_id));

    site_check.map_err(|e| as_environment("site store", e))?;
    state_check.map_err(|e| as_environment("state store", e))?;
    cdn_check.map_err(|e| as_environment("CDN distribution", e))?;

    info!(
        "Pre-flight passed: site {}, state {}, distribution {}",
        site.describe(),
        state.describe(),
        distribution_id
    );
    Ok(())
}

fn as_environment(what: &str, err: DeployError) -> DeployError {
    match err {
        DeployError::Environment(msg) => DeployError::Environment(format!("{what}: {msg}")),
        other => DeployError::Environment(format!("{what}: {other}")),
    }
}
