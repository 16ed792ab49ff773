use crate::config::ApiConfig;
use crate::pipeline::{BatchStatus, Orchestrator};
use crate::record::StoredDetection;
use crate::store::ResultStore;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn ResultStore>,
}

/// Batch trigger request
#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    #[serde(alias = "serial_number")]
    pub device_serial: String,
    /// Capture date, `YYYY-MM-DD`
    pub target_date: NaiveDate,
}

/// Batch trigger response
#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub status: BatchStatus,
    pub message: String,
    pub processed_images: usize,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    fn new(error: &str, code: &str) -> Self {
        Self {
            error: error.to_string(),
            code: code.to_string(),
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

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
        .route("/api/v1/process", post(process_images))
        .route("/api/v1/results/:image_id", get(get_result))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "keypose-processor"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Run one batch for a device and date.
///
/// Fatal batch errors are logged here and reported to the caller without detail.
#[instrument(skip(state))]
async fn process_images(
    State(state): State<AppState>,
    Json(request): Json<ProcessRequest>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let report = state
        .orchestrator
        .run(&request.device_serial, request.target_date)
        .await
        .map_err(|e| {
            error!(
                device_serial = %request.device_serial,
                date = %request.target_date,
                error = %e,
                "Failed to process images"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("Failed to process images", "PROCESSING_ERROR")),
            )
        })?;

    Ok(Json(ProcessResponse {
        status: report.status,
        message: report.message,
        processed_images: report.processed_images,
    }))
}

/// Fetch a stored detection record
async fn get_result(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
) -> Result<Json<StoredDetection>, ApiError> {
    let stored = state.store.get(&image_id).await.map_err(|e| {
        error!(image_id = %image_id, error = %e, "Failed to fetch result");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("Failed to fetch result", "DATABASE_ERROR")),
        )
    })?;

    stored.map(Json).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("Result not found", "NOT_FOUND")),
        )
    })
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting trigger API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
