//! Health check endpoints.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::{Value, json};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Not ready once shutdown has begun.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    if state.scheduler.reporter().shutdown_token().is_cancelled() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "shutting down" })),
        );
    }
    let snapshot = state.scheduler.snapshot().await;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "running": snapshot.running.is_some(),
            "pending": snapshot.pending.len(),
        })),
    )
}
