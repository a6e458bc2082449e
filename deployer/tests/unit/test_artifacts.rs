use std::sync::Arc;

use chrono::Duration;
use tokio_util::sync::CancellationToken;

use site_deployer::artifacts::store::ArtifactStore;
use site_deployer::cache::classifier::CacheClass;
use site_deployer::errors::DeployError;
use site_deployer::publish::source::{BuildDirSource, FileSource};

use crate::common::{write_tree, Harness};

fn artifacts(harness: &Harness) -> ArtifactStore {
    harness.context().artifacts(&CancellationToken::new())
}

async fn build_source(harness: &Harness, files: &[(&str, &str)]) -> Arc<dyn FileSource> {
    harness.write_build(files);
    Arc::new(BuildDirSource::scan(&harness.build_dir()).await.unwrap())
}

#[tokio::test]
async fn test_capture_indexes_and_dedupes() {
    let harness = Harness::new();
    let store = artifacts(&harness);

    let source = build_source(
        &harness,
        &[
            ("index.html", "<h1>home</h1>"),
            ("about/index.html", "<h1>home</h1>"),
            ("app.3f2a.js", "console.log(1)"),
        ],
    )
    .await;
    let version = store.capture(source, Some("abc123".to_string())).await.unwrap();

    assert_eq!(version.file_count, 3);
    assert_eq!(version.source_ref.as_deref(), Some("abc123"));

    // Two files share their contents
    assert_eq!(harness.state.keys_under("blobs/").len(), 2);

    let index = store.index().await.unwrap();
    assert_eq!(index.current.as_deref(), Some(version.id.as_str()));
    assert!(!index.dirty);

    let listed = store.list(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, version.id);

    let fetched = store.get(&version.id).await.unwrap();
    assert_eq!(fetched.manifest, version.manifest);
    assert_eq!(store.current().await.unwrap().unwrap().id, version.id);
}

#[tokio::test]
async fn test_versions_are_listed_newest_first() {
    let harness = Harness::new();
    let store = artifacts(&harness);

    let mut ids = Vec::new();
    for n in 0..3 {
        let source = build_source(&harness, &[("index.html", &format!("v{n}"))]).await;
        ids.push(store.capture(source, None).await.unwrap().id);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let listed: Vec<String> = store.list(10).await.unwrap().into_iter().map(|v| v.id).collect();
    ids.reverse();
    assert_eq!(listed, ids);
    assert_eq!(store.list(2).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_unknown_version_is_not_found() {
    let harness = Harness::new();
    let store = artifacts(&harness);

    let err = store.get("20240101T000000000Z-deadbeef").await.unwrap_err();
    assert!(matches!(err, DeployError::NotFound(_)));
    assert!(store.current().await.unwrap().is_none());
}

#[tokio::test]
async fn test_interrupted_capture_is_not_indexed() {
    let harness = Harness::new();
    let store = artifacts(&harness);

    let source = build_source(&harness, &[("index.html", "one"), ("b.css", "two"), ("c.css", "three")]).await;
    harness.state.crash_after_puts(1);

    assert!(store.capture(source, None).await.is_err());

    harness.state.heal();
    let index = store.index().await.unwrap();
    assert!(index.versions.is_empty());
    assert!(index.current.is_none());
}

#[tokio::test]
async fn test_corrupt_blob_is_detected() {
    let harness = Harness::new();
    let store = artifacts(&harness);

    let source = build_source(&harness, &[("index.html", "hello")]).await;
    let version = store.capture(source, None).await.unwrap();
    let hash = version.manifest[0].hash.clone();

    harness.state.insert(&store.layout().blob_key(&hash), "tampered");

    let err = store.read_blob(&hash).await.unwrap_err();
    assert!(matches!(err, DeployError::ArtifactIo(_)));
}

#[tokio::test]
async fn test_snapshot_does_not_become_current() {
    let harness = Harness::new();
    let store = artifacts(&harness);

    let source = build_source(&harness, &[("index.html", "built")]).await;
    let captured = store.capture(source, None).await.unwrap();

    harness.site.insert("index.html", "served");
    harness.site.insert("legacy/page.html", "old page");

    let snapshot = store.snapshot(harness.site.clone()).await.unwrap();
    assert_eq!(snapshot.file_count, 2);
    assert!(snapshot.entry("legacy/page.html").is_some());

    let index = store.index().await.unwrap();
    assert_eq!(index.current.as_deref(), Some(captured.id.as_str()));
    assert!(index.contains(&snapshot.id));

    let body = store
        .read_blob(&snapshot.entry("index.html").unwrap().hash)
        .await
        .unwrap();
    assert_eq!(&body[..], b"served");
}

#[tokio::test]
async fn test_prune_keeps_current_and_collects_blobs() {
    let harness = Harness::new();
    let store = artifacts(&harness);

    let mut first = None;
    for n in 0..10 {
        let source = build_source(&harness, &[("index.html", &format!("release {n}"))]).await;
        let version = store.capture(source, None).await.unwrap();
        first.get_or_insert(version.id);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    let first = first.unwrap();

    // Serving the oldest version protects it from pruning
    store.set_current(&first).await.unwrap();

    // The current version takes one of the five slots; the four newest
    // fill the rest
    let report = store.prune(Duration::days(30), 5).await.unwrap();
    assert_eq!(report.removed.len(), 5);
    assert_eq!(report.retained, 5);
    assert_eq!(report.blobs_deleted, 5);

    let index = store.index().await.unwrap();
    assert_eq!(index.versions.len(), 5);
    assert!(index.contains(&first));
    assert_eq!(index.current.as_deref(), Some(first.as_str()));
    assert_eq!(harness.state.keys_under("blobs/").len(), 5);

    for removed in &report.removed {
        assert!(matches!(store.get(removed).await, Err(DeployError::NotFound(_))));
    }
}

#[tokio::test]
async fn test_prune_honours_min_count_floor() {
    let harness = Harness::new();
    let mut settings = harness.settings();
    settings.retention.min_count = 2;
    let store = harness.context_with(settings).artifacts(&CancellationToken::new());

    for n in 0..4 {
        let source = build_source(&harness, &[("index.html", &format!("r{n}"))]).await;
        store.capture(source, None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    // Every version is older than a zero max age; only the floor survives
    let report = store.prune(Duration::zero(), 10).await.unwrap();
    assert_eq!(report.retained, 2);
    assert_eq!(report.removed.len(), 2);
}

#[tokio::test]
async fn test_capture_of_empty_source_fails() {
    let harness = Harness::new();
    let store = artifacts(&harness);

    write_tree(&harness.build_dir(), &[]);
    std::fs::create_dir_all(harness.build_dir()).unwrap();
    assert!(matches!(
        BuildDirSource::scan(&harness.build_dir()).await,
        Err(DeployError::ArtifactIo(_))
    ));
    assert!(store.index().await.unwrap().versions.is_empty());
}

#[tokio::test]
async fn test_prune_with_zero_age_keeps_the_most_recent() {
    let harness = Harness::new();
    let store = artifacts(&harness);

    let mut ids = Vec::new();
    for n in 0..10 {
        let source = build_source(&harness, &[("index.html", &format!("build {n}"))]).await;
        ids.push(store.capture(source, None).await.unwrap().id);
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let report = store.prune(Duration::zero(), 5).await.unwrap();
    assert_eq!(report.retained, 5);

    let kept: Vec<String> = store.list(20).await.unwrap().into_iter().map(|v| v.id).collect();
    let newest: Vec<String> = ids.iter().rev().take(5).cloned().collect();
    assert_eq!(kept, newest);
}

#[tokio::test]
async fn test_manifest_records_cache_classes() {
    let harness = Harness::new();
    let store = artifacts(&harness);

    let document = "x".repeat(10 * 1024);
    let script = "y".repeat(50 * 1024);
    let source = build_source(&harness, &[("index.html", &document), ("app.8c1e2f.js", &script)]).await;
    let version = store.capture(source, None).await.unwrap();

    assert_eq!(version.file_count, 2);
    assert_eq!(version.total_size, 60 * 1024);
    assert_eq!(version.entry("index.html").unwrap().cache_class, CacheClass::Document);
    assert_eq!(
        version.entry("app.8c1e2f.js").unwrap().cache_class,
        CacheClass::ImmutableAsset
    );

    let plan = harness.context().planner().plan(&["/index.html"]);
    assert_eq!(plan.patterns, vec!["/index.html".to_string()]);
    assert_eq!(plan.estimated_cost_micros, 5_000);
}
