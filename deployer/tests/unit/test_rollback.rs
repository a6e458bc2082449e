use tokio_util::sync::CancellationToken;

use site_deployer::deploy::orchestrator::{DeployOptions, DeploymentOrchestrator};
use site_deployer::deploy::rollback::RollbackController;
use site_deployer::errors::DeployError;
use site_deployer::models::deployment::{DeploymentKind, DeploymentStatus};
use site_deployer::models::invalidation::InvalidationStatus;

use crate::common::{Harness, MockCdn};

const V1: &[(&str, &str)] = &[
    ("index.html", "<h1>v1</h1>"),
    ("docs/index.html", "<h1>docs</h1>"),
];

const V2: &[(&str, &str)] = &[
    ("index.html", "<h1>v2</h1>"),
    ("docs/index.html", "<h1>docs</h1>"),
    ("pricing.html", "<h1>pricing</h1>"),
];

/// Deploys V1 then V2 and returns the id of V1's version
async fn deployed_twice(harness: &Harness) -> String {
    let orchestrator = DeploymentOrchestrator::new(harness.context(), CancellationToken::new());
    let options = DeployOptions {
        skip_build: true,
        source_ref: Some("abc123".to_string()),
        ..Default::default()
    };

    harness.write_build(V1);
    let first = orchestrator.run(options.clone()).await.unwrap();
    assert!(first.succeeded());

    harness.write_build(V2);
    let second = orchestrator.run(options).await.unwrap();
    assert!(second.succeeded());

    first.deployment.produced_version.unwrap()
}

fn lease_key(harness: &Harness) -> String {
    let ctx = harness.context();
    ctx.layout.lease_key(&ctx.settings.lease.name)
}

fn controller(harness: &Harness) -> RollbackController {
    RollbackController::new(harness.context(), CancellationToken::new())
}

#[tokio::test]
async fn test_rollback_restores_the_previous_version_exactly() {
    let harness = Harness::with_cdn(MockCdn::scripted(vec![InvalidationStatus::Completed]));
    let v1 = deployed_twice(&harness).await;

    let rollback = controller(&harness).rollback(&v1).await.unwrap();
    assert_eq!(rollback.kind, DeploymentKind::Rollback);
    assert_eq!(rollback.status, DeploymentStatus::RolledBack);
    assert!(rollback.failure.is_none(), "{:?}", rollback.failure);
    assert_eq!(rollback.restored_version.as_deref(), Some(v1.as_str()));

    assert_eq!(harness.site.body("index.html").as_deref(), Some("<h1>v1</h1>"));
    assert_eq!(harness.site.body("docs/index.html").as_deref(), Some("<h1>docs</h1>"));
    assert!(harness.site.body("pricing.html").is_none());

    // The served state before the rollback was captured, but not made current
    let artifacts = harness.context().artifacts(&CancellationToken::new());
    let index = artifacts.index().await.unwrap();
    assert_eq!(index.current.as_deref(), Some(v1.as_str()));
    let snapshot = rollback.produced_version.clone().unwrap();
    assert!(index.contains(&snapshot));
    assert_ne!(snapshot, v1);

    let submitted = harness.cdn.submissions();
    let last = submitted.last().unwrap();
    assert!(last.contains(&"/".to_string()));
    assert!(last.contains(&"/index.html".to_string()));
    assert!(last.contains(&"/pricing.html".to_string()));

    let record = harness.context().records().get(&rollback.id).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::RolledBack);
    assert!(harness.context().leases().status().await.unwrap().is_none());
}

#[tokio::test]
async fn test_rolling_back_to_the_snapshot_undoes_a_rollback() {
    let harness = Harness::with_cdn(MockCdn::scripted(vec![InvalidationStatus::Completed]));
    let v1 = deployed_twice(&harness).await;

    let rollback = controller(&harness).rollback(&v1).await.unwrap();
    let snapshot = rollback.produced_version.unwrap();

    let undo = controller(&harness).rollback(&snapshot).await.unwrap();
    assert_eq!(undo.status, DeploymentStatus::RolledBack);
    assert_eq!(harness.site.body("index.html").as_deref(), Some("<h1>v2</h1>"));
    assert_eq!(harness.site.body("pricing.html").as_deref(), Some("<h1>pricing</h1>"));

    let artifacts = harness.context().artifacts(&CancellationToken::new());
    assert_eq!(artifacts.index().await.unwrap().current.as_deref(), Some(snapshot.as_str()));
}

#[tokio::test]
async fn test_rollback_to_unknown_version_fails_before_taking_the_lease() {
    let harness = Harness::with_cdn(MockCdn::scripted(vec![InvalidationStatus::Completed]));
    deployed_twice(&harness).await;
    let lease_key = lease_key(&harness);
    let lease_writes = harness.state.writes_of(&lease_key);

    let err = controller(&harness)
        .rollback("20240101T000000000Z-deadbeef")
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));

    assert_eq!(harness.state.writes_of(&lease_key), lease_writes);
    assert_eq!(harness.context().records().list(10).await.unwrap().len(), 2);
    assert_eq!(harness.site.body("index.html").as_deref(), Some("<h1>v2</h1>"));
}

#[tokio::test]
async fn test_rollback_renews_the_lease_between_phases() {
    let harness = Harness::with_cdn(MockCdn::scripted(vec![InvalidationStatus::Completed]));
    let v1 = deployed_twice(&harness).await;
    let lease_key = lease_key(&harness);
    let before = harness.state.writes_of(&lease_key);

    let rollback = controller(&harness).rollback(&v1).await.unwrap();
    assert_eq!(rollback.status, DeploymentStatus::RolledBack);

    // Acquire, then a renewal after resolve, snapshot, restore, activate
    // and invalidation submit
    assert_eq!(harness.state.writes_of(&lease_key) - before, 6);
    assert!(harness.context().leases().status().await.unwrap().is_none());
}

#[tokio::test]
async fn test_rollback_requires_the_lease() {
    let harness = Harness::with_cdn(MockCdn::scripted(vec![InvalidationStatus::Completed]));
    let v1 = deployed_twice(&harness).await;
    let _held = harness.context().leases().acquire("deploy-in-flight").await.unwrap();

    let err = controller(&harness).rollback(&v1).await.unwrap_err();
    assert_eq!(err.kind(), "concurrent_deployment");
    assert_eq!(harness.site.body("index.html").as_deref(), Some("<h1>v2</h1>"));
}
