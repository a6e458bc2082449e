//! External build step
//!
//! The site generator is opaque: a shell command that must exit zero and
//! leave the output directory behind.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::storage::settings::BuildSettings;

/// Lines of build output kept in error messages
const OUTPUT_TAIL_LINES: usize = 20;

/// Run the configured build (unless skipped) and return the output dir
pub async fn run_build(
    settings: &BuildSettings,
    skip: bool,
    cancel: &CancellationToken,
) -> Result<PathBuf, DeployError> {
    let output_dir = settings.output_path();

    match (&settings.command, skip) {
        (Some(command), false) => {
            run_command(
                command,
                &settings.working_dir,
                Duration::from_secs(settings.timeout_secs),
                cancel,
            )
            .await?;
        }
        (Some(_), true) => info!("Skipping build; using {}", output_dir.display()),
        (None, _) => debug!("No build command configured; using {}", output_dir.display()),
    }

    if !Dir::new(&output_dir).exists().await {
        return Err(DeployError::Build(format!(
            "build output {} does not exist",
            output_dir.display()
        )));
    }
    Ok(output_dir)
}

async fn run_command(
    command: &str,
    working_dir: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), DeployError> {
    info!("Running build: {} (in {})", command, working_dir.display());

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DeployError::Build(format!("failed to start build: {e}")))?;

    let output = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(DeployError::Cancelled("build".to_string()));
        }
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(output) => output.map_err(|e| DeployError::Build(format!("build did not finish: {e}")))?,
            Err(_) => {
                return Err(DeployError::Timeout(format!("build exceeded {timeout:?}")));
            }
        },
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!("Build failed with {}", output.status);
        return Err(DeployError::Build(format!(
            "build exited with {}: {}",
            output.status,
            tail(&stderr, OUTPUT_TAIL_LINES)
        )));
    }

    debug!("Build output:\n{}", tail(&String::from_utf8_lossy(&output.stdout), OUTPUT_TAIL_LINES));
    info!("Build finished");
    Ok(())
}

/// Short commit hash of the working directory, if it is a git checkout
pub async fn detect_source_ref(working_dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .current_dir(working_dir)
        .args(["rev-parse", "--short", "HEAD"])
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!hash.is_empty()).then_some(hash)
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
