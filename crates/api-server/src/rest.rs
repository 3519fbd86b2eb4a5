//! Shared REST state, error mapping and operational endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use cadence_core::error::CadenceError;
use cadence_engine::{SchedulerHandle, SequenceService};
use serde::Serialize;
use std::time::Instant;
use tracing::{error, warn};
use utoipa::ToSchema;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: SequenceService,
    /// `None` when the scheduler is not running in this process.
    pub scheduler: Option<SchedulerHandle>,
    pub node_id: String,
    pub start_time: Instant,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub scheduler_running: bool,
}

/// Engine error carried to the HTTP boundary.
#[derive(Debug)]
pub struct ApiError(pub CadenceError);

impl From<CadenceError> for ApiError {
    fn from(e: CadenceError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            CadenceError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CadenceError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            CadenceError::InvalidState(_) => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_state"),
            CadenceError::InvalidStep(_) | CadenceError::Serialization(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            CadenceError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            CadenceError::Config(_) | CadenceError::Transport(_) | CadenceError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = self.status_and_code();
        let message = if status.is_server_error() {
            error!(error = %self.0, "Request failed");
            metrics::counter!("api.errors").increment(1);
            "Internal processing error".to_string()
        } else {
            warn!(error = %self.0, "Request rejected");
            self.0.to_string()
        };
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

/// GET /health: Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        scheduler_running: state.scheduler.as_ref().is_some_and(|s| s.is_running()),
    })
}

/// GET /ready: Readiness probe. Ready once the datastore answers.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses(
        (status = 200, description = "Ready to accept traffic"),
        (status = 503, description = "Datastore unreachable"),
    )
)]
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.service.list_sequences().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// GET /live: Liveness probe.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
