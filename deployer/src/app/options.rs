//! Command line options

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::deploy::orchestrator::DeployOptions;

/// Versioned static-site deployments to an object store behind a CDN
#[derive(Debug, Parser)]
#[command(name = "site-deploy", version, about)]
pub struct Cli {
    /// Settings file
    #[arg(
        long,
        global = true,
        env = "SITE_DEPLOY_CONFIG",
        default_value = "./site-deploy.json"
    )]
    pub config: PathBuf,

    /// Emit JSON logs on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build, publish, capture and invalidate
    Deploy(DeployArgs),

    /// Inspect, restore and prune captured versions
    #[command(subcommand)]
    Artifact(ArtifactCommand),

    /// Submit or inspect CDN invalidations
    #[command(subcommand)]
    Invalidate(InvalidateCommand),

    /// Inspect or release the deployment lease
    #[command(subcommand)]
    Lease(LeaseCommand),

    /// Recent deployment records
    Deployments {
        #[arg(default_value_t = 10)]
        limit: usize,
    },

    /// Print version information
    Version,
}

impl Command {
    /// Whether the command needs settings and providers
    pub fn needs_settings(&self) -> bool {
        !matches!(self, Command::Version)
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct DeployArgs {
    /// Publish the existing build output without building
    #[arg(long)]
    pub skip_build: bool,

    /// Plan only; nothing is uploaded or recorded
    #[arg(long)]
    pub dry_run: bool,

    /// Invalidate everything instead of the changed paths
    #[arg(long)]
    pub aggressive_invalidate: bool,

    /// Revision to record instead of the detected git revision
    #[arg(long)]
    pub source_ref: Option<String>,
}

impl From<DeployArgs> for DeployOptions {
    fn from(args: DeployArgs) -> Self {
        Self {
            skip_build: args.skip_build,
            dry_run: args.dry_run,
            aggressive_invalidate: args.aggressive_invalidate,
            source_ref: args.source_ref,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum ArtifactCommand {
    /// Captured versions, newest first
    List {
        #[arg(default_value_t = 20)]
        limit: usize,
    },

    /// Manifest of one version
    Show { version_id: String },

    /// Roll the site back to a version
    Restore { version_id: String },

    /// Apply the retention policy now
    Prune {
        /// Overrides retention.max_age_days
        #[arg(long)]
        max_age_days: Option<u64>,

        /// Overrides retention.max_count
        #[arg(long)]
        max_count: Option<usize>,
    },
}

#[derive(Debug, Subcommand)]
pub enum InvalidateCommand {
    /// Invalidate everything (`/*`)
    Full,

    /// Every HTML document of the current version
    Documents,

    /// Every immutable asset of the current version
    Assets,

    /// `/api/*`
    Api,

    /// Refresh one invalidation from the CDN
    Status { invalidation_id: String },

    /// Recorded invalidations, newest first
    List {
        #[arg(default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum LeaseCommand {
    /// Show the current holder
    Status,

    /// Remove an expired lease, or any lease with --force
    Release {
        #[arg(long)]
        force: bool,
    },
}
