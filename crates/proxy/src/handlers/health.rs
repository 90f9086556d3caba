//! Health check endpoint handlers.
//!
//! Served on the internal listener only, so probes never pass through
//! authentication.

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::state::AppState;

/// Handler for the plain health probe.
///
/// # HTTP Request
///
/// `GET /healthz`
///
/// # Response
///
/// - `200 OK` with body `Ok`
/// - `500 Internal Server Error` with body `Unhealthy`
pub async fn healthz_handler(State(state): State<AppState>) -> Response {
    if state.is_healthy() {
        (StatusCode::OK, "Ok").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Unhealthy").into_response()
    }
}

/// Handler for the detailed health report.
///
/// # HTTP Request
///
/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> Response {
    debug!("Processing health check request");

    let keys = match state.identity().keys() {
        Some(keys) if keys.is_healthy() => "ok",
        Some(_) => "stale",
        None => "disabled",
    };
    let label_store = if state.tenants().is_healthy() {
        "ok"
    } else {
        "stale"
    };
    let healthy = state.is_healthy();

    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "label_store": state.tenants().kind().as_str(),
        "checks": {
            "keys": keys,
            "labels": label_store,
        },
        "timestamp": chrono::Utc::now().to_rfc3339()
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(body)).into_response()
}

/// Handler for the readiness probe.
///
/// # HTTP Request
///
/// `GET /ready`
///
/// # Response
///
/// - `200 OK` - Keys and labels are loaded
/// - `503 Service Unavailable` - A background refresh is failing
pub async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
