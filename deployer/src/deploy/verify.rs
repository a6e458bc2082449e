//! Post-deploy verification
//!
//! A single reachability probe of the root document. A failed probe is a
//! warning on the deployment, never a failure.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::storage::settings::VerifySettings;

/// Result of the probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// No site URL configured
    Skipped,
    Passed { status: u16 },
    Failed(String),
}

/// Site reachability checker
pub struct SiteVerifier {
    client: Client,
    site_url: Option<String>,
}

impl SiteVerifier {
    pub fn new(settings: &VerifySettings) -> Result<Self, DeployError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            site_url: settings.site_url.clone(),
        })
    }

    pub async fn verify(&self) -> VerifyOutcome {
        let Some(site_url) = &self.site_url else {
            debug!("No site URL configured; skipping verification");
            return VerifyOutcome::Skipped;
        };

        let url = format!("{}/", site_url.trim_end_matches('/'));
        debug!("GET {}", url);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Verified {} ({})", url, response.status());
                VerifyOutcome::Passed {
                    status: response.status().as_u16(),
                }
            }
            Ok(response) => {
                warn!("Verification of {} returned {}", url, response.status());
                VerifyOutcome::Failed(format!("{url} returned {}", response.status()))
            }
            Err(e) => {
                warn!("Verification of {} failed: {}", url, e);
                VerifyOutcome::Failed(format!("{url} unreachable: {e}"))
            }
        }
    }
}
