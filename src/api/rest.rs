//! Axum REST API handlers

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::engine::FaceAnalyzer;
use crate::service::{EmbedError, EmbedService};

use super::dto::*;

/// Application state shared across handlers
pub struct AppState<A: FaceAnalyzer> {
    pub service: EmbedService<A>,
    pub start_time: Instant,
}

/// Create the REST API router
pub fn create_rest_router<A: FaceAnalyzer + 'static>(
    state: Arc<AppState<A>>,
    max_upload_mb: usize,
) -> Router {
    Router::new()
        .route("/embed-largest-face", post(embed_handler::<A>))
        .route("/health", get(health_handler::<A>))
        .layer(DefaultBodyLimit::max(max_upload_mb * 1024 * 1024))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Embed the largest face found in the uploaded image.
///
/// Multipart form upload, field name "file". A missing field is treated
/// the same as an empty payload.
async fn embed_handler<A: FaceAnalyzer + 'static>(
    State(state): State<Arc<AppState<A>>>,
    mut multipart: Multipart,
) -> Result<Json<EmbedResponse>, (StatusCode, Json<ErrorResponse>)> {
    let mut image_data: Option<Vec<u8>> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(&e.to_string(), "MULTIPART_ERROR")),
        )
    })? {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            image_data = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| {
                        (
                            StatusCode::BAD_REQUEST,
                            Json(ErrorResponse::new(&e.to_string(), "READ_ERROR")),
                        )
                    })?
                    .to_vec(),
            );
        }
    }

    let data = image_data.unwrap_or_default();
    let result = state
        .service
        .embed_largest_face(&data)
        .await
        .map_err(error_response)?;

    Ok(Json(EmbedResponse {
        embedding: result.embedding,
        dim: result.dim,
        bbox: result.bbox,
        det_score: result.det_score,
    }))
}

/// Map a pipeline failure to its client-facing status and body.
/// Internal errors are logged server-side and never leak details.
fn error_response(err: EmbedError) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        EmbedError::EmptyUpload => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("Empty file", "EMPTY_FILE")),
        ),
        EmbedError::Decode(msg) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(&msg, "DECODE_FAILED")),
        ),
        EmbedError::NoFace => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(ErrorResponse::new("No face detected", "NO_FACE")),
        ),
        EmbedError::Internal(e) => {
            error!("embedding request failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("internal server error", "INTERNAL")),
            )
        }
    }
}

/// Health check
async fn health_handler<A: FaceAnalyzer + 'static>(
    State(state): State<Arc<AppState<A>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}
