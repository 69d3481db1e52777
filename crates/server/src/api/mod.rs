use crate::config::{AppState, ServerConfig};
use crate::middleware::auth;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod handlers;

/// Start the API server and the background workers.
pub async fn serve(addr: &str, config: ServerConfig) -> Result<()> {
    let state = Arc::new(AppState::new(config)?);
    state.start_workers();

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        // Workflow definitions
        .route("/api/workflows", get(handlers::list_workflows))
        .route("/api/workflows", post(handlers::create_workflow))
        .route("/api/workflows/{slug}", get(handlers::get_workflow))
        .route("/api/workflows/{slug}", patch(handlers::replace_workflow))
        .route("/api/workflows/{slug}/run", post(handlers::run_workflow))
        // Workflow runs
        .route("/api/workflow-runs/{id}", get(handlers::get_workflow_run))
        .route(
            "/api/workflow-runs/{id}/steps",
            get(handlers::get_workflow_run_steps),
        )
        .route(
            "/api/workflow-runs/{id}/cancel",
            post(handlers::cancel_workflow_run),
        )
        // Assets
        .route("/api/workflows/{slug}/assets", get(handlers::list_assets))
        .route(
            "/api/workflows/{slug}/assets/{asset_id}/history",
            get(handlers::asset_history),
        )
        .route(
            "/api/workflows/{slug}/assets/{asset_id}/partitions",
            get(handlers::asset_partitions),
        )
        // Jobs
        .route("/api/jobs", get(handlers::list_jobs))
        .route("/api/jobs", post(handlers::create_job))
        .route("/api/jobs/{slug}", get(handlers::get_job))
        .route("/api/jobs/{slug}/run", post(handlers::run_job))
        .route("/api/job-runs/{id}", get(handlers::get_job_run))
        // Schedules
        .route("/api/schedules", get(handlers::list_schedules))
        .route("/api/schedules", post(handlers::create_schedule))
        // Event triggers and inbound events
        .route("/api/triggers", get(handlers::list_triggers))
        .route("/api/events", post(handlers::ingest_event))
        // Middleware
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint (still authenticated; liveness probes carry a
/// token or run with auth disabled).
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "weft",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Maps core error kinds (and raw auth statuses) onto HTTP responses.
pub enum ApiError {
    Core(weft_core::Error),
    Status(StatusCode),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        use weft_core::Error::*;
        match self {
            Self::Status(status) => *status,
            Self::Core(error) => match error {
                Validation(_) | MissingDependency { .. } | CycleDetected { .. } => {
                    StatusCode::BAD_REQUEST
                }
                NotFound { .. } => StatusCode::NOT_FOUND,
                Throttled(_) => StatusCode::TOO_MANY_REQUESTS,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        use weft_core::Error::*;
        match self {
            Self::Status(status) if *status == StatusCode::UNAUTHORIZED => "unauthorized",
            Self::Status(status) if *status == StatusCode::FORBIDDEN => "forbidden",
            Self::Status(_) => "error",
            Self::Core(error) => match error {
                Validation(_) => "validation",
                MissingDependency { .. } => "dependency_missing",
                CycleDetected { .. } => "cycle_detected",
                NotFound { .. } => "not_found",
                Throttled(_) => "throttled",
                HandlerMissing { .. } => "handler_missing",
                BundleResolution { .. } | ChecksumMismatch { .. } => "bundle_resolution",
                ServiceUnavailable { .. } => "service_unavailable",
                ServiceHttp { .. } => "service_http_error",
                Template(_) => "template_error",
                _ => "internal",
            },
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Core(error) => error.to_string(),
            Self::Status(status) => status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.message(), "request failed");
        }
        let body = ErrorResponse {
            error: self.message(),
            kind: Some(self.kind().to_string()),
        };
        (status, Json(body)).into_response()
    }
}

impl From<weft_core::Error> for ApiError {
    fn from(err: weft_core::Error) -> Self {
        Self::Core(err)
    }
}

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        Self::Status(status)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
