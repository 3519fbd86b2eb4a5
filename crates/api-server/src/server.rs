//! API server: REST endpoints, tracking routes and the metrics exporter.

use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;
use crate::{sequence_rest, tracking_rest};
use axum::routing::{get, post};
use axum::Router;
use cadence_core::config::AppConfig;
use cadence_engine::{SchedulerHandle, SequenceService};
use std::net::SocketAddr;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// HTTP front of the sequence engine.
pub struct ApiServer {
    config: AppConfig,
    service: SequenceService,
    scheduler: Option<SchedulerHandle>,
}

impl ApiServer {
    pub fn new(
        config: AppConfig,
        service: SequenceService,
        scheduler: Option<SchedulerHandle>,
    ) -> Self {
        Self {
            config,
            service,
            scheduler,
        }
    }

    /// Build the full router.
    pub fn router(&self) -> Router {
        let state = AppState {
            service: self.service.clone(),
            scheduler: self.scheduler.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        };

        Router::new()
            // Sequences
            .route(
                "/v1/sequences",
                post(sequence_rest::handle_create_sequence).get(sequence_rest::handle_list_sequences),
            )
            .route("/v1/sequences/:id", get(sequence_rest::handle_get_sequence))
            .route(
                "/v1/sequences/:id/activate",
                post(sequence_rest::handle_activate_sequence),
            )
            .route(
                "/v1/sequences/:id/deactivate",
                post(sequence_rest::handle_deactivate_sequence),
            )
            .route(
                "/v1/sequences/:id/deliveries",
                get(sequence_rest::handle_list_deliveries),
            )
            .route("/v1/sequences/:id/stats", get(sequence_rest::handle_sequence_stats))
            .route("/v1/stats", get(sequence_rest::handle_all_stats))
            // Enrollments
            .route(
                "/v1/sequences/:id/enrollments",
                post(sequence_rest::handle_enroll),
            )
            .route(
                "/v1/members/:member_id/onboarding",
                post(sequence_rest::handle_enroll_onboarding),
            )
            .route("/v1/enrollments/:id", get(sequence_rest::handle_get_enrollment))
            .route("/v1/enrollments/:id/pause", post(sequence_rest::handle_pause))
            .route("/v1/enrollments/:id/resume", post(sequence_rest::handle_resume))
            .route("/v1/enrollments/:id/advance", post(sequence_rest::handle_advance))
            // Scheduler
            .route("/v1/scheduler/tick", post(sequence_rest::handle_trigger_tick))
            // Tracking
            .route("/t/o/:pixel", get(tracking_rest::handle_open_pixel))
            .route("/t/c/:tracking_id", get(tracking_rest::handle_click))
            // Operational endpoints
            .route("/health", get(rest::health_check))
            .route("/ready", get(rest::readiness))
            .route("/live", get(rest::liveness))
            .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
            // Middleware
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let app = self.router();
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
