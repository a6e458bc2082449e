//! Site Deployer - Entry Point
//!
//! Builds a static site, publishes it to an object store behind a CDN and
//! keeps every published build restorable.

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use site_deployer::app::options::Cli;
use site_deployer::app::report;
use site_deployer::app::run::run;
use site_deployer::app::state::AppState;
use site_deployer::errors::DeployError;
use site_deployer::filesys::file::File;
use site_deployer::logs::{init_logging, LogOptions};
use site_deployer::storage::settings::Settings;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Print version and exit
    if !cli.command.needs_settings() {
        return exit(report::print_version_info().map(|_| report::ExitStatus::Success));
    }

    // Retrieve the settings file
    let settings = match Settings::load(&File::new(&cli.config)).await {
        Ok(settings) => settings,
        Err(e) => {
            report::print_error(&e);
            return ExitCode::from(1);
        }
    };

    // Initialize logging; the guard flushes file logs on exit
    let log_options = LogOptions {
        log_level: settings.log_level,
        json_format: cli.json_logs || settings.log_json,
        log_dir: settings.log_dir.clone(),
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let state = match AppState::init(settings).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize providers: {}", e);
            report::print_error(&e);
            return ExitCode::from(1);
        }
    };
    state.cancel_on_shutdown();

    exit(run(&state, cli.command).await)
}

fn exit(result: Result<report::ExitStatus, DeployError>) -> ExitCode {
    match result {
        Ok(status) => ExitCode::from(status.code() as u8),
        Err(e) => {
            report::print_error(&e);
            ExitCode::from(1)
        }
    }
}
