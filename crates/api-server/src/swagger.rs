//! OpenAPI specification and Swagger UI configuration.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Cadence API",
        version = "0.1.0",
        description = "Email sequence enrollment and delivery engine.\n\nManages time-delayed email sequences, member enrollments, open/click tracking and engagement statistics.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Sequences", description = "Sequence definitions and delivery log"),
        (name = "Enrollments", description = "Enroll, pause, resume and advance members"),
        (name = "Statistics", description = "Sent/open/click counters and rates"),
        (name = "Scheduler", description = "Manual scheduler control"),
        (name = "Tracking", description = "Open pixel and click redirector"),
        (name = "Operations", description = "Health, readiness, and liveness probes"),
    ),
    paths(
        // Sequences
        crate::sequence_rest::handle_create_sequence,
        crate::sequence_rest::handle_list_sequences,
        crate::sequence_rest::handle_get_sequence,
        crate::sequence_rest::handle_activate_sequence,
        crate::sequence_rest::handle_deactivate_sequence,
        crate::sequence_rest::handle_list_deliveries,
        // Enrollments
        crate::sequence_rest::handle_enroll,
        crate::sequence_rest::handle_enroll_onboarding,
        crate::sequence_rest::handle_get_enrollment,
        crate::sequence_rest::handle_pause,
        crate::sequence_rest::handle_resume,
        crate::sequence_rest::handle_advance,
        // Statistics
        crate::sequence_rest::handle_sequence_stats,
        crate::sequence_rest::handle_all_stats,
        // Scheduler
        crate::sequence_rest::handle_trigger_tick,
        // Tracking
        crate::tracking_rest::handle_open_pixel,
        crate::tracking_rest::handle_click,
        // Operations
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        cadence_core::types::Step,
        cadence_core::types::Sequence,
        cadence_core::types::Enrollment,
        cadence_core::types::EnrollmentStatus,
        cadence_core::types::DeliveryRecord,
        cadence_core::types::SequenceStats,
        cadence_core::steps::RawSequence,
        cadence_engine::TickReport,
        crate::sequence_rest::EnrollRequest,
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
    ))
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_tracking_routes() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/t/c/{tracking_id}"));
        assert!(doc.paths.paths.contains_key("/v1/scheduler/tick"));
    }
}
