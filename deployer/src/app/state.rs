//! Application state
//!
//! Connects the configured providers once and hands out pipeline
//! components built on them.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::deploy::orchestrator::DeploymentOrchestrator;
use crate::deploy::rollback::RollbackController;
use crate::deploy::DeployContext;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::providers::cloudfront::CloudFrontCdn;
use crate::providers::fs::FsObjectStore;
use crate::providers::local_cdn::LocalCdn;
use crate::providers::s3::S3ObjectStore;
use crate::providers::{Cdn, ObjectStore};
use crate::storage::settings::{CdnProvider, Settings, StoreSettings};

/// Main application state
pub struct AppState {
    pub ctx: DeployContext,

    /// Cancelled on SIGINT/SIGTERM
    pub cancel: CancellationToken,
}

impl AppState {
    /// Connect the stores and the CDN named in `settings`
    pub async fn init(settings: Settings) -> Result<Self, DeployError> {
        info!("Initializing providers...");

        let site = open_store(&settings.site, "site").await?;
        let state = open_store(&settings.state, "state").await?;
        let cdn = open_cdn(&settings.cdn.provider).await?;

        Ok(Self {
            ctx: DeployContext::new(settings, site, state, cdn),
            cancel: CancellationToken::new(),
        })
    }

    pub fn orchestrator(&self) -> DeploymentOrchestrator {
        DeploymentOrchestrator::new(self.ctx.clone(), self.cancel.clone())
    }

    pub fn rollback(&self) -> RollbackController {
        RollbackController::new(self.ctx.clone(), self.cancel.clone())
    }

    /// Cancel in-flight work when the process is asked to stop. Phases
    /// already running finish their current request and record the
    /// cancellation.
    pub fn cancel_on_shutdown(&self) {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            warn!("Shutdown requested; cancelling in-flight work");
            cancel.cancel();
        });
    }
}

async fn open_store(
    settings: &StoreSettings,
    section: &str,
) -> Result<Arc<dyn ObjectStore>, DeployError> {
    let store: Arc<dyn ObjectStore> = match settings {
        StoreSettings::S3 {
            bucket,
            region,
            endpoint,
            prefix,
            credentials,
        } => Arc::new(
            S3ObjectStore::connect(
                bucket,
                region,
                endpoint.as_deref(),
                prefix.clone(),
                credentials.as_ref(),
            )
            .await,
        ),
        StoreSettings::Local { root } => {
            Dir::new(root)
                .create()
                .await
                .with_context(|| format!("creating {section} store at {}", root.display()))?;
            Arc::new(FsObjectStore::new(root))
        }
    };
    info!("{} store: {}", section, store.describe());
    Ok(store)
}

async fn open_cdn(provider: &CdnProvider) -> Result<Arc<dyn Cdn>, DeployError> {
    let cdn: Arc<dyn Cdn> = match provider {
        CdnProvider::Cloudfront { region, credentials } => {
            Arc::new(CloudFrontCdn::connect(region, credentials.as_ref()).await)
        }
        CdnProvider::Local { root } => {
            Dir::new(root)
                .create()
                .await
                .with_context(|| format!("creating local CDN log at {}", root.display()))?;
            Arc::new(LocalCdn::new(root))
        }
    };
    Ok(cdn)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Unable to listen for Ctrl+C: {}", e);
                    std::future::pending::<()>().await;
                }
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Unable to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    }
}
