//! Webhook endpoint receiving release notifications.
//!
//! An external notifier (autobrr or similar) POSTs one JSON document per
//! release; valid notifications land in the ingest queue and are picked up
//! by the dispatch worker. A small health endpoint reports fleet
//! connectivity.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, Result};
use crate::services::{IngestQueue, InstanceRegistry};

/// What the webhook handlers need: an enqueue capability and connectivity
/// counts. Deliberately narrow; the handlers never touch dispatch state.
#[derive(Clone)]
pub struct WebhookState {
    pub queue: Arc<IngestQueue>,
    pub registry: Arc<InstanceRegistry>,
}

/// Notification payload. All fields arrive as strings; empty strings are
/// treated as absent.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub release_name: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub indexer: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

/// Build the webhook router. `webhook_path` is configurable so the endpoint
/// can be hidden behind an unguessable path.
pub fn router(state: WebhookState, webhook_path: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(webhook_path, post(handle_webhook))
        .with_state(state)
}

/// POST {webhook_path}
async fn handle_webhook(
    State(state): State<WebhookState>,
    payload: Option<Json<WebhookPayload>>,
) -> Result<Json<Value>> {
    let Some(Json(payload)) = payload else {
        tracing::error!("webhook request without JSON body");
        return Err(AppError::BadRequest("No JSON data".to_string()));
    };

    let release_name = non_empty(payload.release_name)
        .ok_or_else(|| AppError::BadRequest("Missing release_name".to_string()))?;
    let download_url = non_empty(payload.download_url)
        .ok_or_else(|| AppError::BadRequest("Missing download_url".to_string()))?;

    let indexer = non_empty(payload.indexer);
    // The indexer name stands in for the category when none is given.
    let category = non_empty(payload.category).or(indexer.clone());

    tracing::info!(
        name = %release_name,
        indexer = ?indexer,
        category = ?category,
        "webhook notification received"
    );

    state
        .queue
        .enqueue(&download_url, &release_name, category)
        .await;

    Ok(Json(json!({
        "status": "success",
        "message": "Torrent processed"
    })))
}

/// GET /health
async fn health(State(state): State<WebhookState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "instances_connected": state.registry.connected_count().await,
    }))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
