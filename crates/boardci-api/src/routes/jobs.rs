//! Job control and log endpoints.
//!
//! Jobs are addressed by `{unique_id}/{sha}`, the pair that appears in status
//! links, and resolved to their full identity through the store.

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use boardci_core::store::{JobRecord, JobStore};
use boardci_core::{JobIdentity, transcript};
use boardci_scheduler::{CancelOutcome, QueueSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt::Write;

use crate::AppState;
use crate::error::ApiError;

const DEFAULT_LIMIT: usize = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{unique_id}/{sha}/restart", post(restart_job))
        .route("/{unique_id}/{sha}/cancel", post(cancel_job))
        .route("/{unique_id}/{sha}/logs", get(job_logs))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub queue: QueueSnapshot,
    pub recent: Vec<JobRecord>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<JobList>, ApiError> {
    let queue = state.scheduler.snapshot().await;
    let recent = state
        .store
        .list_jobs(query.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;
    Ok(Json(JobList { queue, recent }))
}

async fn resolve(state: &AppState, unique_id: u64, sha: &str) -> Result<JobIdentity, ApiError> {
    state
        .store
        .find_identity(unique_id, sha)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {}/{}", unique_id, sha)))
}

async fn restart_job(
    State(state): State<AppState>,
    Path((unique_id, sha)): Path<(u64, String)>,
) -> Result<Json<Value>, ApiError> {
    let identity = resolve(&state, unique_id, &sha).await?;
    let run_id = state.scheduler.restart(&identity).await?;
    Ok(Json(json!({ "status": "queued", "run_id": run_id })))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path((unique_id, sha)): Path<(u64, String)>,
) -> Result<Json<Value>, ApiError> {
    let identity = resolve(&state, unique_id, &sha).await?;
    let outcome = match state.scheduler.cancel(&identity).await? {
        CancelOutcome::Dequeued => "dequeued",
        CancelOutcome::Signalled => "stopping",
        CancelOutcome::DequeuedAndSignalled => "dequeued and stopping",
        CancelOutcome::Acknowledged => "not active",
    };
    Ok(Json(json!({ "status": outcome })))
}

/// Plain text view of the latest run: status, then every stage transcript.
async fn job_logs(
    State(state): State<AppState>,
    Path((unique_id, sha)): Path<(u64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let identity = resolve(&state, unique_id, &sha).await?;
    let status = state.scheduler.status(&identity).await?;
    let logs = state.store.logs(&identity).await?;

    let mut body = String::new();
    let _ = writeln!(body, "{}", identity);
    if let Some(status) = status {
        let _ = writeln!(body, "status: {}", status);
    }
    for log in &logs {
        let _ = writeln!(body, "\n== {} ==", log.stage_name);
        match transcript::render(&log.transcript) {
            Some(rendered) => {
                let _ = writeln!(body, "{}", rendered);
            }
            None => {
                let _ = writeln!(body, "(no output)");
            }
        }
    }

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::app;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use boardci_core::{JobDescriptor, JobStatus};
    use tower::ServiceExt;

    fn descriptor(unique_id: u64, sha: &str) -> JobDescriptor {
        JobDescriptor {
            unique_id,
            change_number: 42,
            project_name: "optee_os".to_string(),
            project_full_name: "OP-TEE/optee_os".to_string(),
            commit_ref: sha.to_string(),
            clone_url: "https://github.com/someone/optee_os.git".to_string(),
            branch: "fix-boot".to_string(),
        }
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_list_jobs() {
        let app = app(None);
        app.state
            .scheduler
            .submit(descriptor(7, "aaa"), false)
            .await
            .unwrap();

        let response = app
            .router
            .oneshot(Request::get("/api/v1/jobs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let list: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(list["queue"]["pending"].as_array().unwrap().len(), 1);
        assert_eq!(list["recent"][0]["status"], "pending");
    }

    #[tokio::test]
    async fn test_cancel_then_restart() {
        let app = app(None);
        let d = descriptor(7, "aaa");
        app.state.scheduler.submit(d.clone(), false).await.unwrap();

        let response = app
            .router
            .clone()
            .oneshot(
                Request::post("/api/v1/jobs/7/aaa/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("dequeued"));
        let record = app.store.get_record(&d.identity()).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);

        let response = app
            .router
            .oneshot(
                Request::post("/api/v1/jobs/7/aaa/restart")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let pending = app.state.scheduler.snapshot().await.pending;
        assert_eq!(pending.len(), 1);
        assert!(pending[0].user_initiated);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let app = app(None);
        for (method, uri) in [
            ("POST", "/api/v1/jobs/1/nope/cancel"),
            ("POST", "/api/v1/jobs/1/nope/restart"),
            ("GET", "/api/v1/jobs/1/nope/logs"),
        ] {
            let response = app
                .router
                .clone()
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{} {}", method, uri);
        }
    }

    #[tokio::test]
    async fn test_logs_are_rendered() {
        let app = app(None);
        let d = descriptor(7, "aaa");
        app.store.register(&d).await.unwrap();
        app.store
            .record(&d.identity(), JobStatus::Failed, None)
            .await
            .unwrap();
        app.store
            .append_log(&d.identity(), "hikey/build", "make\r\n\x1b[31merror\x1b[0m\r\n")
            .await
            .unwrap();
        app.store
            .append_log(&d.identity(), "hikey/power-off", "")
            .await
            .unwrap();

        let response = app
            .router
            .oneshot(
                Request::get("/api/v1/jobs/7/aaa/logs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let text = body_text(response).await;
        assert!(text.contains("status: failed"));
        assert!(text.contains("== hikey/build =="));
        assert!(text.contains("     2:  error"));
        assert!(!text.contains('\x1b'));
        assert!(text.contains("== hikey/power-off ==\n(no output)"));
    }
}
