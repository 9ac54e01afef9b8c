use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::db::DbHandle;
use super::hub::StatusHub;
use super::models::{PipelineStage, UpdateOutcome, UpdateRequest};
use super::pipeline::UpdatePipeline;
use crate::errors::PipelineError;

const DEFAULT_EVENT_LIMIT: i64 = 100;
const DEFAULT_RUN_LIMIT: i64 = 20;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub hub: StatusHub,
    pub db: DbHandle,
    pub pipeline: Arc<UpdatePipeline>,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

// ── Update envelope ───────────────────────────────────────────────────

/// Failure details returned by `POST /update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub stage: Option<PipelineStage>,
    pub kind: String,
    pub message: String,
}

/// `{status: "success" | "error", result: ...}`
#[derive(Debug, Serialize)]
#[serde(tag = "status", content = "result", rename_all = "lowercase")]
pub enum UpdateResponse {
    Success(UpdateOutcome),
    Error(ErrorReport),
}

impl UpdateResponse {
    fn invalid(message: String) -> (StatusCode, Self) {
        (
            StatusCode::BAD_REQUEST,
            Self::Error(ErrorReport {
                stage: None,
                kind: "invalid_request".to_string(),
                message,
            }),
        )
    }

    fn failed(err: &PipelineError) -> (StatusCode, Self) {
        let status = match err {
            PipelineError::Detection { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::Publication { .. } | PipelineError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Self::Error(ErrorReport {
                stage: Some(err.stage()),
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
        )
    }
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/update", post(trigger_update))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/events", get(get_run_events))
        .route("/api/events", get(recent_events))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Run the pipeline to completion and answer with the envelope. The run is
/// spawned so it finishes even if the caller goes away.
async fn trigger_update(
    State(state): State<SharedState>,
    Json(request): Json<UpdateRequest>,
) -> (StatusCode, Json<UpdateResponse>) {
    if let Some(field) = request.missing_field() {
        let (status, body) = UpdateResponse::invalid(format!("{} must not be empty", field));
        return (status, Json(body));
    }

    let pipeline = Arc::clone(&state.pipeline);
    let handle = tokio::spawn(async move { pipeline.run(&request).await });
    let (status, body) = match handle.await {
        Ok(Ok(outcome)) => (StatusCode::OK, UpdateResponse::Success(outcome)),
        Ok(Err(e)) => UpdateResponse::failed(&e),
        Err(join_err) => {
            error!("update task panicked: {}", join_err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                UpdateResponse::Error(ErrorReport {
                    stage: None,
                    kind: "internal_error".to_string(),
                    message: join_err.to_string(),
                }),
            )
        }
    };
    (status, Json(body))
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_RUN_LIMIT);
    let runs = state
        .db
        .call(move |db| db.list_runs(limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let run = state
        .db
        .call(move |db| db.get_run(&lookup))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
    Ok(Json(run))
}

async fn get_run_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let (run, events) = state
        .db
        .call(move |db| Ok((db.get_run(&lookup)?, db.list_events(&lookup)?)))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if run.is_none() && events.is_empty() {
        return Err(ApiError::NotFound(format!("Run {} not found", id)));
    }
    Ok(Json(events))
}

async fn recent_events(
    State(state): State<SharedState>,
    Query(params): Query<LimitParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    let events = state
        .db
        .call(move |db| db.recent_events(limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(events))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpliftConfig;
    use crate::errors::{DetectionError, RewriteJobError};
    use crate::update::db::StatusDb;
    use crate::update::detector::ChangeDetector;
    use crate::update::executor::{RewriteExecutor, RewriteReport};
    use crate::update::github::{NewPullRequest, PullRequestApi};
    use crate::update::models::{CodeChange, RewriteJob, StatusEvent, StatusKind};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct MissingRepoDetector;

    #[async_trait]
    impl ChangeDetector for MissingRepoDetector {
        async fn detect(&self, url: &str) -> Result<Vec<CodeChange>, DetectionError> {
            Err(DetectionError::Clone {
                url: url.to_string(),
                source: git2::Error::from_str("repository not found"),
            })
        }
    }

    struct NoopExecutor;

    #[async_trait]
    impl RewriteExecutor for NoopExecutor {
        async fn rewrite(&self, _job: &RewriteJob) -> Result<RewriteReport, RewriteJobError> {
            Err(RewriteJobError::Malformed("unused".to_string()))
        }
    }

    struct NoopPrApi;

    #[async_trait]
    impl PullRequestApi for NoopPrApi {
        async fn create_pull_request(&self, _request: &NewPullRequest) -> anyhow::Result<String> {
            anyhow::bail!("unused")
        }
    }

    fn test_app() -> (Router, DbHandle) {
        let db = DbHandle::new(StatusDb::new_in_memory().unwrap());
        let hub = StatusHub::new(Arc::new(db.clone()));
        let pipeline = UpdatePipeline::new(
            &UpliftConfig::default(),
            hub.clone(),
            Arc::new(MissingRepoDetector),
            Arc::new(NoopExecutor),
            Arc::new(NoopPrApi),
        )
        .with_db(db.clone());
        let state = Arc::new(AppState {
            hub,
            db: db.clone(),
            pipeline: Arc::new(pipeline),
        });
        (api_router().with_state(state), db)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_update(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/update")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = test_app();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_update_rejects_empty_fields() {
        let (app, _) = test_app();
        let response = app
            .oneshot(post_update(serde_json::json!({
                "repository": "https://github.com/octo/site.git",
                "repository_owner": "",
                "repository_name": "site"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["result"]["kind"], "invalid_request");
        assert!(body["result"]["message"].as_str().unwrap().contains("repository_owner"));
    }

    #[tokio::test]
    async fn test_update_detection_failure_envelope() {
        let (app, db) = test_app();
        let response = app
            .oneshot(post_update(serde_json::json!({
                "repository": "https://github.com/octo/missing.git",
                "repository_owner": "octo",
                "repository_name": "missing"
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["result"]["stage"], "detecting");
        assert_eq!(body["result"]["kind"], "detection_error");

        let runs = db.call(|db| db.list_runs(10)).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].stage, PipelineStage::Failed);
    }

    #[tokio::test]
    async fn test_get_run_and_events() {
        let (app, db) = test_app();
        db.call(|db| {
            db.create_run(
                "run-1",
                &UpdateRequest {
                    repository: "https://github.com/octo/site.git".to_string(),
                    repository_owner: "octo".to_string(),
                    repository_name: "site".to_string(),
                },
            )?;
            db.append_event("run-1", &StatusEvent::new(StatusKind::Detecting, "one"))?;
            db.append_event("run-1", &StatusEvent::new(StatusKind::Dispatching, "two"))?;
            Ok(())
        })
        .await
        .unwrap();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/runs/run-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let run: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(run["owner"], "octo");
        assert_eq!(run["stage"], "detecting");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/runs/run-1/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let events: Vec<serde_json::Value> = body_json(response.into_body()).await;
        let statuses: Vec<_> = events.iter().map(|e| e["status"].as_str().unwrap()).collect();
        assert_eq!(statuses, vec!["DETECTING", "DISPATCHING"]);

        let response = app
            .oneshot(Request::builder().uri("/api/events?limit=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let events: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["message"], "two");
    }

    #[tokio::test]
    async fn test_get_missing_run_is_404() {
        let (app, _) = test_app();
        for uri in ["/api/runs/nope", "/api/runs/nope/events"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }
}
