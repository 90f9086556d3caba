//! Prometheus scrape endpoint.

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::error;

use crate::state::AppState;

/// Handler for the metrics scrape.
///
/// # HTTP Request
///
/// `GET /metrics`
///
/// # Response
///
/// - `200 OK` with the text exposition format
/// - `500 Internal Server Error` if encoding fails
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    let (format_type, body) = match state.metrics().encode() {
        Ok(encoded) => encoded,
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            return (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response();
        }
    };

    match HeaderValue::from_str(&format_type) {
        Ok(value) => ([(header::CONTENT_TYPE, value)], body).into_response(),
        Err(err) => {
            error!(error = %err, "failed to build content-type header");
            (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
        }
    }
}
