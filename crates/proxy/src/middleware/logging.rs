//! Request logging.
//!
//! Logs each proxied request with its headers. Credential headers are
//! replaced by `[redacted]` unless token logging is enabled.

use std::fmt;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, header},
    middleware::Next,
    response::Response,
};
use tracing::{debug, info};

use crate::state::AppState;

static SENSITIVE: [HeaderName; 3] = [
    header::AUTHORIZATION,
    HeaderName::from_static("x-id-token"),
    HeaderName::from_static("x-plugin-id"),
];

/// Debug view of a header map that hides credentials.
pub struct RedactedHeaders<'a> {
    headers: &'a HeaderMap,
    show_tokens: bool,
}

impl<'a> RedactedHeaders<'a> {
    /// Wraps `headers`; `show_tokens` disables redaction.
    pub fn new(headers: &'a HeaderMap, show_tokens: bool) -> Self {
        Self {
            headers,
            show_tokens,
        }
    }
}

impl fmt::Debug for RedactedHeaders<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.headers {
            if !self.show_tokens && SENSITIVE.contains(name) {
                map.entry(&name.as_str(), &"[redacted]");
            } else {
                map.entry(&name.as_str(), &value.to_str().unwrap_or("[binary]"));
            }
        }
        map.finish()
    }
}

/// Middleware logging the request line, headers and outcome.
pub async fn log_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    debug!(
        method = %method,
        path = %path,
        headers = ?RedactedHeaders::new(request.headers(), state.config().log_tokens),
        "incoming request"
    );

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request completed"
    );
    response
}
