//! HTTP ingress: job submission, status probe, and the live-feed upgrade.
//!
//! Submission does not touch the registry directly: it publishes
//! `job.submitted` and lets the orchestrator's own subscription create the
//! state, so bus-submitted and HTTP-submitted jobs take the same path.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::bus::EventPublisher;
use crate::events::{self, JobSubmitted, Platform, DEFAULT_PLATFORMS, JOB_SUBMITTED};
use crate::hub::{self, Hub};
use crate::registry::JobRegistry;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub publisher: Arc<dyn EventPublisher>,
    pub hub: Hub,
    pub default_threshold: u32,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub design_url: Option<String>,
    pub repo_url: Option<String>,
    pub platforms: Option<Vec<Platform>>,
    pub styling: Option<String>,
    pub threshold: Option<u32>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", post(create_job))
        .route("/api/status", get(status))
        .route("/health", get(health_check))
}

/// Full application router: API, WebSocket live feed, permissive CORS for
/// the browser frontend.
pub fn build_router(state: SharedState) -> Router {
    let hub = state.hub.clone();
    api_router()
        .route(
            "/ws",
            get(move |upgrade: WebSocketUpgrade| hub::ws_handler(upgrade, hub)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn create_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let design_url = match req.design_url {
        Some(url) if !url.is_empty() => url,
        _ => return Err(ApiError::BadRequest("design_url required".into())),
    };

    // An explicitly empty platform list falls back to the defaults; an
    // explicit threshold of 0 is honored (every diff passes).
    let platforms = match req.platforms {
        Some(platforms) if !platforms.is_empty() => platforms,
        _ => DEFAULT_PLATFORMS.to_vec(),
    };
    let styling = match req.styling {
        Some(styling) if !styling.is_empty() => styling,
        _ => "tailwind".to_string(),
    };
    let threshold = req.threshold.unwrap_or(state.default_threshold);
    if threshold > 100 {
        return Err(ApiError::BadRequest(
            "threshold must be within 0..=100".into(),
        ));
    }

    let payload = JobSubmitted {
        job_id: Uuid::new_v4().to_string(),
        design_url,
        repo_url: req.repo_url.filter(|url| !url.is_empty()),
        platforms,
        styling,
        threshold,
    };
    let body = events::wrap(JOB_SUBMITTED, &payload)
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    state
        .publisher
        .publish(JOB_SUBMITTED, body)
        .await
        .map_err(|err| ApiError::Internal(format!("queue error: {}", err)))?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"job_id": payload.job_id, "status": "queued"})),
    ))
}

async fn status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "online",
        "active_jobs": state.registry.active_jobs(),
    }))
}

async fn health_check() -> &'static str {
    "OK"
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::{FailingPublisher, RecordingPublisher};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> (SharedState, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let state = Arc::new(AppState {
            registry: Arc::new(JobRegistry::new()),
            publisher: publisher.clone(),
            hub: Hub::new(),
            default_threshold: 95,
        });
        (state, publisher)
    }

    fn post_jobs(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/jobs")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: axum::response::Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_job_queues_submission_with_defaults() {
        let (state, publisher) = test_state();
        let app = build_router(state);

        let resp = app
            .oneshot(post_jobs(serde_json::json!({"design_url": "https://figma.example/f/1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "queued");
        assert!(body["job_id"].is_string());

        let submitted: Vec<JobSubmitted> = publisher.decoded(JOB_SUBMITTED);
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].platforms, DEFAULT_PLATFORMS.to_vec());
        assert_eq!(submitted[0].styling, "tailwind");
        assert_eq!(submitted[0].threshold, 95);
        assert_eq!(submitted[0].job_id, body["job_id"].as_str().unwrap());
    }

    #[tokio::test]
    async fn create_job_requires_design_url() {
        let (state, publisher) = test_state();
        let app = build_router(state);

        let resp = app
            .oneshot(post_jobs(serde_json::json!({"platforms": ["react"]})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn create_job_replaces_empty_platform_list() {
        let (state, publisher) = test_state();
        let app = build_router(state);

        let resp = app
            .oneshot(post_jobs(serde_json::json!({
                "design_url": "https://figma.example/f/1",
                "platforms": [],
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let submitted: Vec<JobSubmitted> = publisher.decoded(JOB_SUBMITTED);
        assert_eq!(submitted[0].platforms, DEFAULT_PLATFORMS.to_vec());
    }

    #[tokio::test]
    async fn create_job_honors_explicit_zero_threshold() {
        let (state, publisher) = test_state();
        let app = build_router(state);

        let resp = app
            .oneshot(post_jobs(serde_json::json!({
                "design_url": "https://figma.example/f/1",
                "threshold": 0,
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let submitted: Vec<JobSubmitted> = publisher.decoded(JOB_SUBMITTED);
        assert_eq!(submitted[0].threshold, 0);
    }

    #[tokio::test]
    async fn create_job_rejects_threshold_above_100() {
        let (state, publisher) = test_state();
        let app = build_router(state);

        let resp = app
            .oneshot(post_jobs(serde_json::json!({
                "design_url": "https://figma.example/f/1",
                "threshold": 101,
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn create_job_rejects_unknown_platform() {
        let (state, publisher) = test_state();
        let app = build_router(state);

        let resp = app
            .oneshot(post_jobs(serde_json::json!({
                "design_url": "https://figma.example/f/1",
                "platforms": ["vaporware"],
            })))
            .await
            .unwrap();
        assert!(resp.status().is_client_error());
        assert!(publisher.published().is_empty());
    }

    #[tokio::test]
    async fn create_job_surfaces_queue_errors() {
        let state = Arc::new(AppState {
            registry: Arc::new(JobRegistry::new()),
            publisher: Arc::new(FailingPublisher),
            hub: Hub::new(),
            default_threshold: 95,
        });
        let app = build_router(state);

        let resp = app
            .oneshot(post_jobs(serde_json::json!({"design_url": "https://figma.example/f/1"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(resp).await;
        assert!(body["error"].as_str().unwrap().contains("queue error"));
    }

    #[tokio::test]
    async fn status_reports_active_jobs() {
        let (state, _) = test_state();
        state
            .registry
            .insert("job-1", vec![Platform::React], 95, String::new());
        let app = build_router(state);

        let resp = app
            .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "online");
        assert_eq!(body["active_jobs"], 1);
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let (state, _) = test_state();
        let app = build_router(state);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
