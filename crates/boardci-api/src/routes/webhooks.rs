//! Webhook endpoint for GitHub.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use boardci_core::JobDescriptor;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

/// Pull request actions that produce a new job.
const BUILD_ACTIONS: &[&str] = &["opened", "synchronize", "reopened"];

pub fn router() -> Router<AppState> {
    Router::new().route("/github", post(github_webhook))
}

/// Handle GitHub webhook events.
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let delivery = headers
        .get("X-GitHub-Delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get("X-Hub-Signature-256")
            .and_then(|v| v.to_str().ok());
        if !verify_github_signature(secret, &body, signature) {
            warn!(event = %event_type, %delivery, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid signature".to_string()));
        }
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;

    info!(event = %event_type, %delivery, "Received GitHub webhook");

    match event_type {
        "ping" => {
            info!("Ping event received - webhook is configured correctly");
            Ok((StatusCode::OK, Json(json!({ "status": "pong" }))))
        }
        "pull_request" => handle_pull_request(&state, &payload).await,
        _ => {
            info!(event = %event_type, "Unhandled event type");
            Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))))
        }
    }
}

async fn handle_pull_request(
    state: &AppState,
    payload: &Value,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let action = payload
        .get("action")
        .and_then(|a| a.as_str())
        .unwrap_or_default();
    if !BUILD_ACTIONS.contains(&action) {
        info!(%action, "Ignoring pull request action");
        return Ok((StatusCode::OK, Json(json!({ "status": "ignored" }))));
    }

    let descriptor = JobDescriptor::from_github_payload(payload)
        .ok_or_else(|| ApiError::BadRequest("Incomplete pull_request payload".to_string()))?;

    info!(
        job = %descriptor.identity(),
        %action,
        branch = %descriptor.branch,
        "Queueing pull request"
    );

    let run_id = state.scheduler.submit(descriptor, false).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "queued", "run_id": run_id })),
    ))
}

/// Verify GitHub webhook signature.
pub fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    // Signature format: "sha256=<hex>"
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}
