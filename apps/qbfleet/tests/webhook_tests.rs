//! Integration tests for the webhook HTTP surface.

mod common;

use axum::http::StatusCode;
use serde_json::{json, Value};

use common::TestApp;

#[tokio::test]
async fn test_valid_notification_is_queued() {
    let app = TestApp::new();

    let response = app
        .server
        .post("/webhook")
        .json(&json!({
            "release_name": "Some.Release.2160p.WEB-DL",
            "download_url": "https://indexer.example/dl/1234.torrent",
            "indexer": "indexer-a",
            "category": "tv"
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "success");
    assert_eq!(body["message"], "Torrent processed");

    let pending = app.queue.snapshot().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].release_name, "Some.Release.2160p.WEB-DL");
    assert_eq!(pending[0].category.as_deref(), Some("tv"));
}

#[tokio::test]
async fn test_indexer_used_as_category_fallback() {
    let app = TestApp::new();

    let response = app
        .server
        .post("/webhook")
        .json(&json!({
            "release_name": "Some.Release",
            "download_url": "https://indexer.example/dl/1.torrent",
            "indexer": "indexer-a"
        }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let pending = app.queue.snapshot().await;
    assert_eq!(pending[0].category.as_deref(), Some("indexer-a"));
}

#[tokio::test]
async fn test_empty_category_falls_back_to_indexer() {
    let app = TestApp::new();

    app.server
        .post("/webhook")
        .json(&json!({
            "release_name": "Some.Release",
            "download_url": "https://indexer.example/dl/1.torrent",
            "indexer": "indexer-a",
            "category": ""
        }))
        .await;

    let pending = app.queue.snapshot().await;
    assert_eq!(pending[0].category.as_deref(), Some("indexer-a"));
}

#[tokio::test]
async fn test_missing_body_returns_no_json_error() {
    let app = TestApp::new();

    let response = app.server.post("/webhook").text("not json").await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], "No JSON data");
}

#[tokio::test]
async fn test_missing_required_fields_rejected() {
    let app = TestApp::new();

    let response = app
        .server
        .post("/webhook")
        .json(&json!({"download_url": "https://indexer.example/dl/1.torrent"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = app
        .server
        .post("/webhook")
        .json(&json!({"release_name": "Some.Release"}))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    assert!(app.queue.is_empty().await);
}

#[tokio::test]
async fn test_duplicate_notification_not_requeued() {
    let app = TestApp::new();
    let payload = json!({
        "release_name": "Some.Release",
        "download_url": "https://indexer.example/dl/1.torrent"
    });

    let first = app.server.post("/webhook").json(&payload).await;
    let second = app.server.post("/webhook").json(&payload).await;

    // A repeat notification still succeeds, it just doesn't queue twice.
    assert_eq!(first.status_code(), StatusCode::OK);
    assert_eq!(second.status_code(), StatusCode::OK);
    assert_eq!(app.queue.len().await, 1);
}

#[tokio::test]
async fn test_health_reports_connectivity() {
    let app = TestApp::new();

    let response = app.server.get("/health").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    let connected = app.registry.connected_count().await as i64;
    assert_eq!(body["instances_connected"], connected);
    assert_eq!(connected, 0);
    let timestamp = body["timestamp"].as_str().expect("timestamp present");
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
}

#[tokio::test]
async fn test_custom_webhook_path() {
    let app = TestApp::with_path("/hooks/secret-path");

    let response = app
        .server
        .post("/hooks/secret-path")
        .json(&json!({
            "release_name": "Some.Release",
            "download_url": "https://indexer.example/dl/1.torrent"
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    // The default path is not routed.
    let response = app
        .server
        .post("/webhook")
        .json(&json!({
            "release_name": "Some.Release",
            "download_url": "https://indexer.example/dl/2.torrent"
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}
