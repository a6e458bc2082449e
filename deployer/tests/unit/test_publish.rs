use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use site_deployer::artifacts::manifest::Version;
use site_deployer::errors::DeployError;
use site_deployer::publish::engine::PublishEngine;
use site_deployer::publish::source::{BuildDirSource, FileSource};

use crate::common::Harness;

const SITE: &[(&str, &str)] = &[
    ("index.html", "<h1>home</h1>"),
    ("about.html", "<h1>about</h1>"),
    ("assets/app.3f2a9c.js", "console.log('app')"),
    ("manifest.json", "{}"),
    ("sw.js", "self.addEventListener('fetch', () => {})"),
];

fn publisher(harness: &Harness) -> PublishEngine {
    harness.context().publisher(&CancellationToken::new())
}

async fn scan(harness: &Harness, files: &[(&str, &str)]) -> Arc<dyn FileSource> {
    harness.write_build(files);
    Arc::new(BuildDirSource::scan(&harness.build_dir()).await.unwrap())
}

fn as_version(source: &dyn FileSource) -> Version {
    Version::new(
        "20240101T000000000Z-00000000".to_string(),
        chrono::Utc::now(),
        None,
        source.entries().to_vec(),
    )
}

#[tokio::test]
async fn test_first_publish_uploads_everything_with_headers() {
    let harness = Harness::new();
    let source = scan(&harness, SITE).await;

    let report = publisher(&harness).publish(source, None).await.unwrap();
    assert_eq!(report.uploaded.len(), SITE.len());
    assert_eq!(report.unchanged, 0);
    assert_eq!(harness.site.body("about.html").as_deref(), Some("<h1>about</h1>"));

    let html = harness.site.headers("index.html").unwrap();
    assert_eq!(html.cache_control.as_deref(), Some("public, max-age=300, must-revalidate"));
    assert_eq!(html.content_type.as_deref(), Some("text/html; charset=utf-8"));

    let asset = harness.site.headers("assets/app.3f2a9c.js").unwrap();
    assert_eq!(asset.cache_control.as_deref(), Some("public, max-age=31536000, immutable"));
    assert_eq!(
        asset.content_type.as_deref(),
        Some("application/javascript; charset=utf-8")
    );

    let manifest = harness.site.headers("manifest.json").unwrap();
    assert_eq!(manifest.cache_control.as_deref(), Some("public, max-age=3600"));

    let worker = harness.site.headers("sw.js").unwrap();
    assert_eq!(
        worker.cache_control.as_deref(),
        Some("no-cache, no-store, must-revalidate")
    );
}

#[tokio::test]
async fn test_diff_uploads_only_changed_files() {
    let harness = Harness::new();
    let engine = publisher(&harness);

    let first = scan(&harness, SITE).await;
    let previous = as_version(first.as_ref());

    let mut changed = SITE.to_vec();
    changed[1] = ("about.html", "<h1>about us</h1>");
    let second = scan(&harness, &changed).await;

    let plan = engine.diff(second.as_ref(), Some(&previous));
    assert_eq!(plan.uploads.len(), 1);
    assert_eq!(plan.uploads[0].path, "about.html");
    assert_eq!(plan.unchanged, SITE.len() - 1);
    assert!(plan.deletions.is_empty());
    assert_eq!(plan.changed_paths(), vec!["about.html".to_string()]);

    let report = engine.execute(second, &plan).await.unwrap();
    assert_eq!(report.uploaded, vec!["about.html".to_string()]);
    assert_eq!(harness.site.put_count(), 1);
}

#[tokio::test]
async fn test_removed_files_are_deleted_when_enabled() {
    let harness = Harness::new();
    let first = scan(&harness, SITE).await;
    let previous = as_version(first.as_ref());
    publisher(&harness).publish(first, None).await.unwrap();

    let second = scan(&harness, &SITE[..4]).await;

    let kept = publisher(&harness).with_delete_removed(false);
    assert!(kept.diff(second.as_ref(), Some(&previous)).deletions.is_empty());

    let report = publisher(&harness)
        .with_delete_removed(true)
        .publish(second, Some(&previous))
        .await
        .unwrap();
    assert_eq!(report.deleted, vec!["sw.js".to_string()]);
    assert_eq!(report.changed_paths, vec!["sw.js".to_string()]);
    assert!(harness.site.body("sw.js").is_none());
}

#[tokio::test]
async fn test_transient_upload_failures_are_retried() {
    let harness = Harness::new();
    let source = scan(&harness, SITE).await;
    harness.site.fail_transiently("index.html", 2);

    let report = publisher(&harness).publish(source, None).await.unwrap();
    assert_eq!(report.uploaded.len(), SITE.len());
    assert_eq!(harness.site.body("index.html").as_deref(), Some("<h1>home</h1>"));
}

#[tokio::test]
async fn test_fatal_upload_failure_fails_the_publish() {
    let harness = Harness::new();
    let source = scan(&harness, SITE).await;
    harness.site.fail_fatally("about.html");

    let err = publisher(&harness).publish(source, None).await.unwrap_err();
    assert!(matches!(err, DeployError::Publish(_)));
    assert!(err.to_string().contains("about.html"));
}

#[tokio::test]
async fn test_cancelled_publish_reports_cancellation() {
    let harness = Harness::new();
    let source = scan(&harness, SITE).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let engine = harness.context().publisher(&cancel);

    let err = engine.publish(source, None).await.unwrap_err();
    assert!(matches!(err, DeployError::Cancelled(_)));
    assert_eq!(harness.site.put_count(), 0);
}
