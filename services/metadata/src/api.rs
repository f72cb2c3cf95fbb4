use crate::config::ApiConfig;
use crate::event::IdentityKey;
use crate::handler::{Handler, InvocationResult};
use crate::store::{IdempotentStore, MetadataRecord};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<Handler>,
    pub store: IdempotentStore,
}

impl AppState {
    pub fn new(handler: Arc<Handler>) -> Self {
        let store = handler.store().clone();
        Self { handler, store }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
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
        .route("/v1/events", post(receive_event))
        .route("/v1/records/:identity_key", get(get_record))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "metadata-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let backend = state.store.inner().backend();

    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": backend
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": backend,
                "error": e.to_string()
            })),
        ),
    }
}

/// Handle one change notification.
///
/// The body is taken as raw bytes so that non-JSON input reaches the event
/// parser and is reported as a malformed event rather than an extractor error.
async fn receive_event(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<InvocationResult>) {
    let outcome = state.handler.handle(&body).await;
    let result = InvocationResult::from(&outcome);
    let status = StatusCode::from_u16(result.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    (status, Json(result))
}

/// Get the stored record for an identity key.
///
/// Identity keys are standard base64 and may contain `/`, `+` and `=`, so
/// clients must percent-encode the key as one path segment
/// (`Zm9vL2E/Py5qcGc=-0` is requested as `Zm9vL2E%2FPy5qcGc%3D-0`).
#[instrument(skip(state))]
async fn get_record(
    State(state): State<AppState>,
    Path(identity_key): Path<String>,
) -> Result<Json<MetadataRecord>, (StatusCode, Json<ErrorResponse>)> {
    let record = state
        .store
        .get(&IdentityKey::from_raw(identity_key))
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to get record");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Failed to get record".to_string(),
                    code: "STORE_ERROR".to_string(),
                }),
            )
        })?;

    match record {
        Some(r) => Ok(Json(r)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Record not found".to_string(),
                code: "NOT_FOUND".to_string(),
            }),
        )),
    }
}

/// Start the invocation API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting metadata API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
