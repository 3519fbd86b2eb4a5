//! Sequence, enrollment, statistics and scheduler REST endpoints.

use crate::rest::{ApiError, AppState, ErrorResponse};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cadence_core::steps::RawSequence;
use cadence_core::types::{DeliveryRecord, Enrollment, Sequence, SequenceStats};
use cadence_engine::TickReport;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Deserialize, ToSchema)]
pub struct EnrollRequest {
    pub member_id: Uuid,
}

/// POST /v1/sequences: Create a sequence from a raw definition.
#[utoipa::path(
    post,
    path = "/v1/sequences",
    tag = "Sequences",
    request_body = RawSequence,
    responses(
        (status = 201, description = "Sequence created", body = Sequence),
        (status = 400, description = "Malformed steps", body = ErrorResponse),
    )
)]
pub async fn handle_create_sequence(
    State(state): State<AppState>,
    Json(raw): Json<RawSequence>,
) -> Result<(StatusCode, Json<Sequence>), ApiError> {
    let sequence = state.service.create_sequence(raw).await?;
    Ok((StatusCode::CREATED, Json(sequence)))
}

/// GET /v1/sequences: List sequences.
#[utoipa::path(
    get,
    path = "/v1/sequences",
    tag = "Sequences",
    responses((status = 200, description = "All sequences", body = Vec<Sequence>))
)]
pub async fn handle_list_sequences(
    State(state): State<AppState>,
) -> Result<Json<Vec<Sequence>>, ApiError> {
    Ok(Json(state.service.list_sequences().await?))
}

/// GET /v1/sequences/:id: Fetch one sequence.
#[utoipa::path(
    get,
    path = "/v1/sequences/{id}",
    tag = "Sequences",
    params(("id" = Uuid, Path, description = "Sequence id")),
    responses(
        (status = 200, description = "Sequence", body = Sequence),
        (status = 404, description = "Unknown sequence", body = ErrorResponse),
    )
)]
pub async fn handle_get_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Sequence>, ApiError> {
    Ok(Json(state.service.get_sequence(id).await?))
}

/// POST /v1/sequences/:id/activate
#[utoipa::path(
    post,
    path = "/v1/sequences/{id}/activate",
    tag = "Sequences",
    params(("id" = Uuid, Path, description = "Sequence id")),
    responses((status = 200, description = "Sequence activated", body = Sequence))
)]
pub async fn handle_activate_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Sequence>, ApiError> {
    Ok(Json(state.service.set_sequence_active(id, true).await?))
}

/// POST /v1/sequences/:id/deactivate
#[utoipa::path(
    post,
    path = "/v1/sequences/{id}/deactivate",
    tag = "Sequences",
    params(("id" = Uuid, Path, description = "Sequence id")),
    responses((status = 200, description = "Sequence deactivated", body = Sequence))
)]
pub async fn handle_deactivate_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Sequence>, ApiError> {
    Ok(Json(state.service.set_sequence_active(id, false).await?))
}

/// GET /v1/sequences/:id/deliveries: Delivery log of a sequence.
#[utoipa::path(
    get,
    path = "/v1/sequences/{id}/deliveries",
    tag = "Sequences",
    params(("id" = Uuid, Path, description = "Sequence id")),
    responses((status = 200, description = "Delivery records", body = Vec<DeliveryRecord>))
)]
pub async fn handle_list_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<DeliveryRecord>>, ApiError> {
    Ok(Json(state.service.list_deliveries(id).await?))
}

/// POST /v1/sequences/:id/enrollments: Enroll a member.
#[utoipa::path(
    post,
    path = "/v1/sequences/{id}/enrollments",
    tag = "Enrollments",
    params(("id" = Uuid, Path, description = "Sequence id")),
    request_body = EnrollRequest,
    responses(
        (status = 201, description = "Member enrolled", body = Enrollment),
        (status = 404, description = "Unknown sequence or member", body = ErrorResponse),
        (status = 409, description = "Member already enrolled", body = ErrorResponse),
    )
)]
pub async fn handle_enroll(
    State(state): State<AppState>,
    Path(sequence_id): Path<Uuid>,
    Json(request): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<Enrollment>), ApiError> {
    let enrollment = state.service.enroll(request.member_id, sequence_id).await?;
    metrics::counter!("api.enrollments").increment(1);
    Ok((StatusCode::CREATED, Json(enrollment)))
}

/// POST /v1/members/:member_id/onboarding: Enroll in every onboarding sequence.
#[utoipa::path(
    post,
    path = "/v1/members/{member_id}/onboarding",
    tag = "Enrollments",
    params(("member_id" = Uuid, Path, description = "Member id")),
    responses((status = 200, description = "Enrollments created", body = Vec<Enrollment>))
)]
pub async fn handle_enroll_onboarding(
    State(state): State<AppState>,
    Path(member_id): Path<Uuid>,
) -> Result<Json<Vec<Enrollment>>, ApiError> {
    Ok(Json(state.service.enroll_onboarding(member_id).await?))
}

/// GET /v1/enrollments/:id
#[utoipa::path(
    get,
    path = "/v1/enrollments/{id}",
    tag = "Enrollments",
    params(("id" = Uuid, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment", body = Enrollment),
        (status = 404, description = "Unknown enrollment", body = ErrorResponse),
    )
)]
pub async fn handle_get_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ApiError> {
    Ok(Json(state.service.get_enrollment(id).await?))
}

/// POST /v1/enrollments/:id/pause
#[utoipa::path(
    post,
    path = "/v1/enrollments/{id}/pause",
    tag = "Enrollments",
    params(("id" = Uuid, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment paused", body = Enrollment),
        (status = 422, description = "Enrollment is not active", body = ErrorResponse),
    )
)]
pub async fn handle_pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ApiError> {
    Ok(Json(state.service.pause(id).await?))
}

/// POST /v1/enrollments/:id/resume
#[utoipa::path(
    post,
    path = "/v1/enrollments/{id}/resume",
    tag = "Enrollments",
    params(("id" = Uuid, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment resumed", body = Enrollment),
        (status = 422, description = "Enrollment is not paused", body = ErrorResponse),
    )
)]
pub async fn handle_resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ApiError> {
    Ok(Json(state.service.resume(id).await?))
}

/// POST /v1/enrollments/:id/advance: Skip the current step without sending.
#[utoipa::path(
    post,
    path = "/v1/enrollments/{id}/advance",
    tag = "Enrollments",
    params(("id" = Uuid, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment advanced", body = Enrollment),
        (status = 422, description = "Enrollment already completed", body = ErrorResponse),
    )
)]
pub async fn handle_advance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ApiError> {
    Ok(Json(state.service.advance(id).await?))
}

/// GET /v1/sequences/:id/stats
#[utoipa::path(
    get,
    path = "/v1/sequences/{id}/stats",
    tag = "Statistics",
    params(("id" = Uuid, Path, description = "Sequence id")),
    responses((status = 200, description = "Engagement statistics", body = SequenceStats))
)]
pub async fn handle_sequence_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SequenceStats>, ApiError> {
    Ok(Json(state.service.sequence_stats(id).await?))
}

/// GET /v1/stats: Statistics for every sequence.
#[utoipa::path(
    get,
    path = "/v1/stats",
    tag = "Statistics",
    responses((status = 200, description = "Engagement statistics", body = Vec<SequenceStats>))
)]
pub async fn handle_all_stats(
    State(state): State<AppState>,
) -> Result<Json<Vec<SequenceStats>>, ApiError> {
    Ok(Json(state.service.all_sequence_stats().await?))
}

/// POST /v1/scheduler/tick: Run one scheduler tick now.
#[utoipa::path(
    post,
    path = "/v1/scheduler/tick",
    tag = "Scheduler",
    responses(
        (status = 200, description = "Tick finished", body = TickReport),
        (status = 503, description = "Scheduler not running or datastore down", body = ErrorResponse),
    )
)]
pub async fn handle_trigger_tick(State(state): State<AppState>) -> Response {
    let Some(scheduler) = state.scheduler.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "scheduler_unavailable".to_string(),
                message: "scheduler is not running on this node".to_string(),
            }),
        )
            .into_response();
    };
    match scheduler.trigger().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}
