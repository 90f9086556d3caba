//! Gateway errors and their HTTP responses.
//!
//! [`GatewayError`] is the only place failure responses are written. Bodies
//! are short `text/plain` messages.
//!
//! | Error | HTTP Status | Body |
//! |-------|-------------|------|
//! | Auth | 403 | `authentication failed` |
//! | Enforce | 403 | enforcement message, e.g. `unauthorized namespace ns2` |
//! | Forbidden | 403 | message |
//! | Labels | 500 | `tenant lookup failed` |
//! | Upstream | 502 | `bad gateway` |

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use gatekeep_labels::LabelError;
use gatekeep_query::EnforceError;
use thiserror::Error;
use tracing::{error, warn};

use crate::auth::AuthError;

/// Errors terminating a proxied request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The caller could not be authenticated.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The query was rejected.
    #[error(transparent)]
    Enforce(#[from] EnforceError),

    /// The request cannot be enforced (unreadable or unsupported body).
    #[error("{0}")]
    Forbidden(String),

    /// The tenant lookup failed.
    #[error("tenant lookup failed: {0}")]
    Labels(#[from] LabelError),

    /// The upstream could not be reached.
    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Status code of the response.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Auth(_) | GatewayError::Enforce(_) | GatewayError::Forbidden(_) => {
                StatusCode::FORBIDDEN
            }
            GatewayError::Labels(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Body shown to the caller.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Auth(_) => AuthError::PUBLIC_MESSAGE.to_string(),
            GatewayError::Enforce(e) => e.to_string(),
            GatewayError::Forbidden(message) => message.clone(),
            GatewayError::Labels(_) => "tenant lookup failed".to_string(),
            GatewayError::Upstream(_) => "bad gateway".to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "request denied");
        }

        let mut response = (status, format!("{}\n", self.public_message())).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}
