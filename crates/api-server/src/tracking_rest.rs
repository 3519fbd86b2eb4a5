//! Open pixel and click redirector.
//!
//! Both endpoints answer the same way whether or not the tracking id is
//! known, so recipients never see an error and ids cannot be probed.

use crate::rest::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::sync::OnceLock;
use utoipa::IntoParams;

/// 1×1 transparent GIF.
const PIXEL_B64: &str = "R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7";

fn pixel() -> &'static [u8] {
    static PIXEL: OnceLock<Vec<u8>> = OnceLock::new();
    PIXEL.get_or_init(|| STANDARD.decode(PIXEL_B64).unwrap_or_default())
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ClickQuery {
    /// Original link target.
    pub url: Option<String>,
}

/// GET /t/o/:pixel: Open beacon. The path segment is `{tracking_id}.gif`.
#[utoipa::path(
    get,
    path = "/t/o/{pixel}",
    tag = "Tracking",
    params(("pixel" = String, Path, description = "`{tracking_id}.gif`")),
    responses((status = 200, description = "1x1 transparent GIF", content_type = "image/gif"))
)]
pub async fn handle_open_pixel(
    State(state): State<AppState>,
    Path(pixel_name): Path<String>,
) -> Response {
    let tracking_id = pixel_name.strip_suffix(".gif").unwrap_or(&pixel_name);
    state.service.record_open(tracking_id).await;
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
        ],
        pixel(),
    )
        .into_response()
}

/// GET /t/c/:tracking_id?url=: Record a click and redirect.
#[utoipa::path(
    get,
    path = "/t/c/{tracking_id}",
    tag = "Tracking",
    params(("tracking_id" = String, Path, description = "Tracking id"), ClickQuery),
    responses((status = 302, description = "Redirect to the original link"))
)]
pub async fn handle_click(
    State(state): State<AppState>,
    Path(tracking_id): Path<String>,
    Query(query): Query<ClickQuery>,
) -> Response {
    let target = state
        .service
        .record_click(&tracking_id, query.url.as_deref())
        .await;
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, target),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
    )
        .into_response()
}
