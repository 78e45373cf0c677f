//! End-to-end behaviour of the registry endpoint between mirror nodes

mod common;

use axum::http::StatusCode;
use common::{manifest, spawn_node, NodeOptions, PeerBehaviour};
use hyprmirror_core::oci::{Digest, ImageName};
use hyprmirror_core::registry::{CONTENT_DIGEST_HEADER, MIRRORED_HEADER};
use hyprmirror_core::routing::MemoryOverlay;
use hyprmirror_core::state::ReconcileMode;
use hyprmirror_core::throttle::{ByteRate, Limiter};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn overlay() -> Arc<MemoryOverlay> {
    MemoryOverlay::new(Duration::from_secs(600))
}

#[tokio::test]
async fn test_api_version_and_health() -> anyhow::Result<()> {
    let node = spawn_node(&overlay(), "a", NodeOptions::default()).await?;
    let client = reqwest::Client::new();

    let response = client.get(node.url("/v2/")).send().await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["Docker-Distribution-API-Version"],
        "registry/2.0"
    );

    let response = client.get(node.url("/healthz")).send().await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = client.delete(node.url("/v2/library/alpine/manifests/latest")).send().await?;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    Ok(())
}

#[tokio::test]
async fn test_serves_local_content() -> anyhow::Result<()> {
    let node = spawn_node(&overlay(), "a", NodeOptions::default()).await?;
    let layer = node.store.import_blob(b"layer bytes").await?;
    let digest = node.store.import_blob(&manifest("local")).await?;
    node.store
        .tag_image(&ImageName::parse("ghcr.io/org/app:v1")?, &digest)
        .await?;
    let client = reqwest::Client::new();

    let response = client
        .get(node.url("/v2/org/app/manifests/v1?ns=ghcr.io"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_DIGEST_HEADER], digest.to_string().as_str());
    assert_eq!(response.headers()["content-type"], common::OCI_MANIFEST);
    assert_eq!(response.bytes().await?.to_vec(), manifest("local"));

    let response = client
        .head(node.url(&format!("/v2/org/app/blobs/{layer}?ns=ghcr.io")))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "11");
    assert_eq!(response.headers()[CONTENT_DIGEST_HEADER], layer.to_string().as_str());

    let response = client
        .get(node.url(&format!("/v2/org/app/blobs/{layer}")))
        .send()
        .await?;
    assert_eq!(response.bytes().await?.as_ref(), b"layer bytes");
    Ok(())
}

#[tokio::test]
async fn test_not_found_is_distinct_from_unavailable() -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let missing = Digest::sha256_of(b"nobody has this");

    // No provider anywhere: 404
    let node = spawn_node(&overlay(), "a", NodeOptions::default()).await?;
    let response = client
        .get(node.url(&format!("/v2/library/alpine/blobs/{missing}")))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["errors"][0]["code"], "BLOB_UNKNOWN");

    // Providers exist but all fail: 503
    let broken = common::spawn_fake_peer(
        "broken",
        PeerBehaviour::Status(StatusCode::INTERNAL_SERVER_ERROR),
        Arc::new(Mutex::new(Vec::new())),
    )
    .await?;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let router = common::FixedRouter::new(vec![broken.record.clone()]);
    let node = common::spawn_node_with_router(listener, router, NodeOptions::default()).await?;
    let response = client
        .get(node.url(&format!("/v2/library/alpine/blobs/{missing}")))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["errors"][0]["code"], "UNAVAILABLE");

    // Malformed digests are rejected up front
    let response = client
        .get(node.url("/v2/library/alpine/blobs/sha256:nothex"))
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_blob_replicates_between_nodes() -> anyhow::Result<()> {
    let overlay = overlay();
    let a = spawn_node(&overlay, "a", NodeOptions::default()).await?;
    let b = spawn_node(&overlay, "b", NodeOptions::default()).await?;

    let content = vec![7u8; 64 * 1024];
    let digest = a.store.import_blob(&content).await?;
    a.tracker.reconcile(ReconcileMode::Full).await?;
    assert_eq!(overlay.provider_count(&digest.to_string()), 1);

    let response = reqwest::get(b.url(&format!("/v2/library/alpine/blobs/{digest}"))).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_DIGEST_HEADER], digest.to_string().as_str());
    let body = response.bytes().await?;
    assert_eq!(Digest::sha256_of(&body), digest);
    assert_eq!(b.resolver.metrics().snapshot().peer_hits, 1);

    // The runtime stores what it pulled; B's next cycle advertises it too
    b.store.import_verified(&digest, &body).await?;
    let report = b.tracker.reconcile(ReconcileMode::Full).await?;
    assert_eq!(report.added, 1);
    assert_eq!(overlay.provider_count(&digest.to_string()), 2);
    Ok(())
}

#[tokio::test]
async fn test_tag_resolved_through_peer() -> anyhow::Result<()> {
    let overlay = overlay();
    let a = spawn_node(&overlay, "a", NodeOptions::default()).await?;
    let b = spawn_node(&overlay, "b", NodeOptions::default()).await?;

    let name = ImageName::parse("docker.io/library/alpine:3.20")?;
    let digest = a.store.import_blob(&manifest("tagged")).await?;
    a.store.tag_image(&name, &digest).await?;
    a.tracker.reconcile(ReconcileMode::Full).await?;

    let response = reqwest::get(b.url("/v2/library/alpine/manifests/3.20?ns=docker.io")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_DIGEST_HEADER], digest.to_string().as_str());
    assert_eq!(response.bytes().await?.to_vec(), manifest("tagged"));
    assert_eq!(b.tags.get(&name), Some(digest));
    Ok(())
}

#[tokio::test]
async fn test_mirrored_requests_do_not_loop() -> anyhow::Result<()> {
    let overlay = overlay();
    let a = spawn_node(&overlay, "a", NodeOptions::default()).await?;
    let b = spawn_node(&overlay, "b", NodeOptions::default()).await?;

    let digest = a.store.import_blob(b"only on a").await?;
    a.tracker.reconcile(ReconcileMode::Full).await?;

    // A peer asking B directly gets only what B holds
    let response = reqwest::Client::new()
        .get(b.url(&format!("/v2/library/alpine/blobs/{digest}")))
        .header(MIRRORED_HEADER, "true")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(b.resolver.metrics().snapshot().peer_attempts, 0);
    Ok(())
}

#[tokio::test]
async fn test_blob_bandwidth_is_capped() -> anyhow::Result<()> {
    let rate = 64 * 1024;
    let limiter = Limiter::new(ByteRate::bytes_per_sec(rate));
    let node = spawn_node(
        &overlay(),
        "a",
        NodeOptions {
            limiter,
            ..Default::default()
        },
    )
    .await?;

    let blob = vec![1u8; (rate * 3) as usize];
    let layer = node.store.import_blob(&blob).await?;
    let manifest_digest = node.store.import_blob(&manifest("fast")).await?;

    let started = Instant::now();
    let response = reqwest::get(node.url(&format!("/v2/library/alpine/manifests/{manifest_digest}"))).await?;
    response.bytes().await?;
    assert!(started.elapsed() < Duration::from_millis(500));

    // One second of burst, then two seconds at the configured rate
    let started = Instant::now();
    let response = reqwest::get(node.url(&format!("/v2/library/alpine/blobs/{layer}"))).await?;
    let body = response.bytes().await?;
    let elapsed = started.elapsed();
    assert_eq!(body.len(), blob.len());
    assert!(elapsed >= Duration::from_millis(1800), "took {elapsed:?}");
    Ok(())
}
