use std::time::Duration;

use tokio_util::sync::CancellationToken;

use site_deployer::deploy::orchestrator::{DeployOptions, DeployOutcome, DeploymentOrchestrator};
use site_deployer::errors::DeployError;
use site_deployer::models::deployment::{Deployment, DeploymentKind, DeploymentStatus, PhaseStatus};
use site_deployer::models::invalidation::InvalidationStatus;
use site_deployer::storage::settings::Settings;
use site_deployer::utils::sha256_hash;

use crate::common::{Harness, MockCdn};

const V1: &[(&str, &str)] = &[
    ("index.html", "<h1>v1</h1>"),
    ("about.html", "<h1>about</h1>"),
    ("assets/app.1111.js", "console.log(1)"),
];

/// CDN that reports completion on the first poll
fn harness() -> Harness {
    Harness::with_cdn(MockCdn::scripted(vec![InvalidationStatus::Completed]))
}

fn options() -> DeployOptions {
    DeployOptions {
        skip_build: true,
        source_ref: Some("abc123".to_string()),
        ..Default::default()
    }
}

async fn deploy(harness: &Harness, settings: Settings, options: DeployOptions) -> DeployOutcome {
    DeploymentOrchestrator::new(harness.context_with(settings), CancellationToken::new())
        .run(options)
        .await
        .unwrap()
}

fn phase_names(outcome: &DeployOutcome) -> Vec<(&str, PhaseStatus)> {
    outcome
        .deployment
        .phases
        .iter()
        .map(|p| (p.name.as_str(), p.status))
        .collect()
}

#[tokio::test]
async fn test_first_deploy_runs_every_phase() {
    let harness = harness();
    harness.write_build(V1);

    let outcome = deploy(&harness, harness.settings(), options()).await;
    assert!(outcome.succeeded(), "{:?}", outcome.deployment.failure);
    assert!(!outcome.deployment.has_warnings());

    assert_eq!(
        phase_names(&outcome),
        vec![
            ("preflight", PhaseStatus::Success),
            ("build", PhaseStatus::Success),
            ("publish", PhaseStatus::Success),
            ("capture", PhaseStatus::Success),
            ("invalidate", PhaseStatus::Success),
            ("verify", PhaseStatus::Skipped),
        ]
    );

    let deployment = &outcome.deployment;
    assert_eq!(deployment.source_ref.as_deref(), Some("abc123"));
    assert!(deployment.finished_at.is_some());
    assert_eq!(harness.site.body("index.html").as_deref(), Some("<h1>v1</h1>"));

    let ctx = harness.context();
    let current = ctx.artifacts(&CancellationToken::new()).current().await.unwrap().unwrap();
    assert_eq!(deployment.produced_version.as_deref(), Some(current.id.as_str()));

    let invalidation = outcome.invalidation.as_ref().unwrap();
    assert_eq!(invalidation.status, InvalidationStatus::Completed);
    assert_eq!(invalidation.caller_reference, deployment.id);
    assert_eq!(deployment.invalidation_id.as_deref(), Some(invalidation.id.as_str()));

    let record = ctx.records().get(&deployment.id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Success);
    assert_eq!(ctx.records().list(10).await.unwrap().len(), 1);

    assert!(ctx.leases().status().await.unwrap().is_none());
}

#[tokio::test]
async fn test_redeploy_invalidates_only_changed_paths() {
    let harness = harness();
    harness.write_build(V1);
    deploy(&harness, harness.settings(), options()).await;

    let mut v2 = V1.to_vec();
    v2[1] = ("about.html", "<h1>about us</h1>");
    harness.write_build(&v2);

    let outcome = deploy(&harness, harness.settings(), options()).await;
    assert!(outcome.succeeded());

    let plan = outcome.publish_plan.as_ref().unwrap();
    assert_eq!(plan.uploads.len(), 1);
    assert_eq!(plan.unchanged, 2);

    let invalidation_plan = outcome.invalidation_plan.as_ref().unwrap();
    assert_eq!(invalidation_plan.patterns, vec!["/about.html".to_string()]);
    assert_eq!(
        harness.cdn.submissions().last().unwrap(),
        &vec!["/about.html".to_string()]
    );
    assert_eq!(harness.site.body("about.html").as_deref(), Some("<h1>about us</h1>"));
}

#[tokio::test]
async fn test_unchanged_redeploy_skips_invalidation() {
    let harness = harness();
    harness.write_build(V1);
    deploy(&harness, harness.settings(), options()).await;
    let puts = harness.site.put_count();

    let outcome = deploy(&harness, harness.settings(), options()).await;
    assert!(outcome.succeeded());
    assert_eq!(harness.site.put_count(), puts);
    assert_eq!(harness.cdn.submissions().len(), 1);
    assert!(outcome.invalidation.is_none());
    assert!(outcome
        .deployment
        .phases
        .iter()
        .any(|p| p.name == "invalidate" && p.status == PhaseStatus::Skipped));
}

#[tokio::test]
async fn test_aggressive_invalidation_covers_everything() {
    let harness = harness();
    harness.write_build(V1);

    let outcome = deploy(
        &harness,
        harness.settings(),
        DeployOptions {
            aggressive_invalidate: true,
            ..options()
        },
    )
    .await;
    assert!(outcome.succeeded());
    assert_eq!(harness.cdn.submissions(), vec![vec!["/*".to_string()]]);
}

#[tokio::test]
async fn test_held_lease_blocks_a_second_deployment() {
    let harness = harness();
    harness.write_build(V1);
    let ctx = harness.context();
    let _held = ctx.leases().acquire("someone-else").await.unwrap();

    let err = DeploymentOrchestrator::new(ctx.clone(), CancellationToken::new())
        .run(options())
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ConcurrentDeployment { .. }));
    assert!(harness.site.keys().is_empty());
    assert!(ctx.records().list(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let harness = harness();
    harness.write_build(V1);

    let outcome = deploy(
        &harness,
        harness.settings(),
        DeployOptions {
            dry_run: true,
            ..options()
        },
    )
    .await;

    assert_eq!(outcome.deployment.status, DeploymentStatus::Success);
    assert!(outcome.deployment.dry_run);
    assert_eq!(outcome.publish_plan.as_ref().unwrap().uploads.len(), V1.len());
    assert!(!outcome.invalidation_plan.as_ref().unwrap().is_empty());

    assert!(harness.site.keys().is_empty());
    assert!(harness.state.keys().is_empty());
    assert!(harness.cdn.submissions().is_empty());
}

#[tokio::test]
async fn test_failed_publish_rolls_back_when_enabled() {
    let harness = harness();
    harness.write_build(V1);
    let first = deploy(&harness, harness.settings(), options()).await;
    let v1 = first.deployment.produced_version.clone().unwrap();

    let mut v2 = V1.to_vec();
    v2[0] = ("index.html", "<h1>v2</h1>");
    v2.push(("broken.html", "never stored"));
    harness.write_build(&v2);
    harness.site.fail_fatally("broken.html");

    let mut settings = harness.settings();
    settings.auto_rollback_on_publish_failure = true;
    let outcome = deploy(&harness, settings, options()).await;

    let deployment = &outcome.deployment;
    assert_eq!(deployment.status, DeploymentStatus::RolledBack);
    let failure = deployment.failure.as_ref().unwrap();
    assert_eq!(failure.phase, "publish");
    assert_eq!(failure.kind, "publish");
    assert_eq!(deployment.restored_version.as_deref(), Some(v1.as_str()));

    assert_eq!(harness.site.body("index.html").as_deref(), Some("<h1>v1</h1>"));
    let artifacts = harness.context().artifacts(&CancellationToken::new());
    let index = artifacts.index().await.unwrap();
    assert_eq!(index.current.as_deref(), Some(v1.as_str()));
    assert!(!index.dirty);

    let record = harness.context().records().get(&deployment.id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::RolledBack);
}

#[tokio::test]
async fn test_failed_publish_marks_index_dirty_for_next_deploy() {
    let harness = harness();
    harness.write_build(V1);
    deploy(&harness, harness.settings(), options()).await;

    let mut v2 = V1.to_vec();
    v2.push(("broken.html", "never stored"));
    harness.write_build(&v2);
    harness.site.fail_fatally("broken.html");

    let failed = deploy(&harness, harness.settings(), options()).await;
    assert_eq!(failed.deployment.status, DeploymentStatus::Failed);
    assert_eq!(failed.deployment.failure.as_ref().unwrap().phase, "publish");
    assert!(failed.deployment.produced_version.is_none());

    let artifacts = harness.context().artifacts(&CancellationToken::new());
    assert!(artifacts.index().await.unwrap().dirty);

    harness.site.heal();
    let recovered = deploy(&harness, harness.settings(), options()).await;
    assert!(recovered.succeeded());
    assert!(recovered.deployment.has_warnings());
    assert_eq!(recovered.publish_plan.as_ref().unwrap().uploads.len(), v2.len());
    assert_eq!(harness.site.body("broken.html").as_deref(), Some("never stored"));
    assert!(!artifacts.index().await.unwrap().dirty);
}

#[tokio::test]
async fn test_slow_invalidation_is_a_warning() {
    let harness = Harness::with_cdn(MockCdn::never_completes());
    harness.write_build(V1);
    let mut settings = harness.settings();
    settings.cdn.max_wait_secs = 0;

    let outcome = deploy(&harness, settings, options()).await;
    assert_eq!(outcome.deployment.status, DeploymentStatus::Success);
    assert!(outcome
        .deployment
        .warnings
        .iter()
        .any(|w| w.phase == "invalidate"));
    assert_eq!(
        outcome.invalidation.as_ref().unwrap().status,
        InvalidationStatus::InProgress
    );
}

#[tokio::test]
async fn test_missing_build_output_fails_the_build_phase() {
    let harness = harness();

    let outcome = deploy(&harness, harness.settings(), options()).await;
    assert_eq!(outcome.deployment.status, DeploymentStatus::Failed);
    let failure = outcome.deployment.failure.as_ref().unwrap();
    assert_eq!(failure.phase, "build");
    assert_eq!(failure.kind, "build");
    assert!(harness.site.keys().is_empty());
    assert!(harness.context().leases().status().await.unwrap().is_none());
}

#[tokio::test]
async fn test_build_command_produces_the_published_output() {
    let harness = harness();
    let mut settings = harness.settings();
    settings.build.command = Some("mkdir -p dist && printf built > dist/index.html".to_string());

    let outcome = deploy(
        &harness,
        settings,
        DeployOptions {
            skip_build: false,
            ..options()
        },
    )
    .await;
    assert!(outcome.succeeded(), "{:?}", outcome.deployment.failure);
    assert_eq!(harness.site.body("index.html").as_deref(), Some("built"));
}

#[tokio::test]
async fn test_failing_build_command_stops_the_run() {
    let harness = harness();
    harness.write_build(V1);
    let mut settings = harness.settings();
    settings.build.command = Some("exit 3".to_string());

    let outcome = deploy(
        &harness,
        settings,
        DeployOptions {
            skip_build: false,
            ..options()
        },
    )
    .await;
    assert_eq!(outcome.deployment.status, DeploymentStatus::Failed);
    assert_eq!(outcome.deployment.failure.as_ref().unwrap().kind, "build");
    assert!(harness.site.keys().is_empty());
}

#[tokio::test]
async fn test_failed_capture_forces_a_full_republish() {
    let harness = harness();
    harness.write_build(V1);
    deploy(&harness, harness.settings(), options()).await;

    let mut v2 = V1.to_vec();
    v2[0] = ("index.html", "<h1>v2</h1>");
    harness.write_build(&v2);
    let layout = harness.context().layout;
    harness
        .state
        .fail_fatally(&layout.blob_key(&sha256_hash(b"<h1>v2</h1>")));

    let failed = deploy(&harness, harness.settings(), options()).await;
    assert_eq!(failed.deployment.status, DeploymentStatus::Failed);
    assert_eq!(failed.deployment.failure.as_ref().unwrap().phase, "capture");
    assert_eq!(harness.site.body("index.html").as_deref(), Some("<h1>v2</h1>"));
    let artifacts = harness.context().artifacts(&CancellationToken::new());
    assert!(artifacts.index().await.unwrap().dirty);

    // Rebuilding the version still recorded as current must not be a no-op
    harness.state.heal();
    harness.write_build(V1);
    let recovered = deploy(&harness, harness.settings(), options()).await;
    assert!(recovered.succeeded(), "{:?}", recovered.deployment.failure);
    assert_eq!(recovered.publish_plan.as_ref().unwrap().uploads.len(), V1.len());
    assert_eq!(harness.site.body("index.html").as_deref(), Some("<h1>v1</h1>"));
    assert!(!artifacts.index().await.unwrap().dirty);
}

#[tokio::test]
async fn test_failed_invalidation_reports_no_produced_version() {
    let harness = harness();
    harness.write_build(V1);
    harness.cdn.throttle_creates(100);

    let outcome = deploy(&harness, harness.settings(), options()).await;
    let deployment = &outcome.deployment;
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(deployment.failure.as_ref().unwrap().phase, "invalidate");
    assert!(deployment.produced_version.is_none());
    assert!(deployment.warnings.iter().any(|w| w.phase == "capture"));

    let record = harness.context().records().get(&deployment.id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.produced_version.is_none());

    let artifacts = harness.context().artifacts(&CancellationToken::new());
    assert!(artifacts.index().await.unwrap().dirty);
}

#[tokio::test]
async fn test_started_run_is_recorded_before_it_finishes() {
    let harness = harness();
    let records = harness.context().records();

    let mut deployment = Deployment::new("20260101T000000000Z-0000abcd".to_string(), DeploymentKind::Deploy);
    records.begin(&deployment).await.unwrap();

    let stored = records.get(&deployment.id).await.unwrap();
    assert_eq!(stored.status, DeploymentStatus::InProgress);
    let listed = records.list(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, DeploymentStatus::InProgress);

    deployment.status = DeploymentStatus::Success;
    deployment.finished_at = Some(chrono::Utc::now());
    records.save(&deployment).await.unwrap();

    assert_eq!(records.get(&deployment.id).await.unwrap().status, DeploymentStatus::Success);
    let listed = records.list(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, DeploymentStatus::Success);

    // A finalized record is never rewritten
    assert!(records.save(&deployment).await.is_err());
}

#[tokio::test]
async fn test_publish_timeout_stops_uploads_before_returning() {
    let harness = harness();
    harness.write_build(V1);
    harness.site.delay_writes(Duration::from_secs(3));
    let mut settings = harness.settings();
    settings.phase_timeout_secs = 1;

    let outcome = deploy(&harness, settings, options()).await;
    let failure = outcome.deployment.failure.as_ref().unwrap();
    assert_eq!(failure.phase, "publish");
    assert_eq!(failure.kind, "timeout");
    assert!(harness.context().leases().status().await.unwrap().is_none());

    // Nothing lands after the run gave up
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(harness.site.keys().is_empty());
}
