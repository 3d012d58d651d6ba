use crate::config::ApiConfig;
use crate::health::{HealthProbe, HealthStatus};
use crate::image_service::{ImageService, StoreError};
use crate::repository::Image;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::stream::{self, TryStreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub images: Arc<ImageService>,
    pub probe: Arc<dyn HealthProbe>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, error: impl Into<String>, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

impl From<StoreError> for (StatusCode, Json<ErrorResponse>) {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(name) => {
                error_response(StatusCode::NOT_FOUND, format!("Image not found: {name}"), "NOT_FOUND")
            }
            StoreError::InvalidName(_) | StoreError::Upload(_) => {
                warn!(error = %e, "Rejected image request");
                error_response(StatusCode::BAD_REQUEST, e.to_string(), "BAD_REQUEST")
            }
            other => {
                error!(error = %other, "Image store failure");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Image store failure",
                    "STORE_ERROR",
                )
            }
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/images", get(list_images).post(upload_images))
        .route("/api/images/:name", axum::routing::delete(delete_image))
        .route("/api/images/:name/raw", get(serve_image))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health endpoint backed by the configured probe
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.probe.check().await;
    let status = match report.status {
        HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Up | HealthStatus::Unknown => StatusCode::OK,
    };

    (status, Json(report))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.images.repository().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "repository": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "repository": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

#[instrument(skip(state))]
async fn list_images(State(state): State<AppState>) -> Result<Json<Vec<Image>>, ApiError> {
    let images: Vec<Image> = state.images.find_all_images().try_collect().await?;
    Ok(Json(images))
}

/// Stream the stored bytes; a missing file only surfaces here, as a 404
#[instrument(skip(state))]
async fn serve_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let resource = state.images.find_one_image(&name).await?;
    let file = resource.open().await?;

    Ok((
        [(header::CONTENT_TYPE, get_content_type(&name))],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Accept a multipart form; every field carrying a file name is stored.
///
/// Fields are streamed to disk chunk by chunk as they arrive.
#[instrument(skip(state, multipart))]
async fn upload_images(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    let parts = stream::unfold(
        (multipart, state.images.clone()),
        |(mut multipart, images)| async move {
            loop {
                match multipart.next_field().await {
                    Ok(Some(field)) => {
                        // Empty file inputs arrive as `filename=""`.
                        let filename = match field.file_name() {
                            Some(name) if !name.is_empty() => name.to_string(),
                            _ => continue,
                        };
                        let chunks = stream::try_unfold(field, |mut field| async move {
                            Ok::<_, MultipartError>(
                                field.chunk().await?.map(|chunk| (chunk, field)),
                            )
                        })
                        .map_err(|e| StoreError::Upload(e.to_string()));

                        let part = images.spool(&filename, chunks).await;
                        return Some((part, (multipart, images)));
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        return Some((Err(StoreError::Upload(e.to_string())), (multipart, images)))
                    }
                }
            }
        },
    );

    state.images.create_image(parts).await?;

    info!("Upload request completed");
    Ok(StatusCode::CREATED)
}

#[instrument(skip(state))]
async fn delete_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.images.delete_image(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Content type from the file extension
fn get_content_type(name: &str) -> &'static str {
    let extension = std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);

    match extension.as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Start the image API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting image API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
