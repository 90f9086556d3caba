//! Caller authentication.
//!
//! Turns an `Authorization: Bearer <jwt>` header into an [`Identity`]. Tokens
//! are verified against a [`JwksCache`]; in development mode verification is
//! skipped and the claims are decoded as-is.

pub mod jwks;

pub use jwks::{JwksCache, KeySetError};

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use gatekeep_labels::Identity;
use http::HeaderValue;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Reasons a caller could not be authenticated.
///
/// The variants are logged; callers only ever see [`AuthError::PUBLIC_MESSAGE`].
#[derive(Debug, Error)]
pub enum AuthError {
    /// No `Authorization` header.
    #[error("missing authorization header")]
    MissingHeader,

    /// The header is not `Bearer <token>`.
    #[error("malformed authorization header")]
    MalformedHeader,

    /// The token is not a decodable JWT.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// No key with the token's key ID is known.
    #[error("unknown signing key '{0}'")]
    UnknownKey(String),

    /// Signature, algorithm or time claims did not validate.
    #[error("invalid token: {0}")]
    InvalidSignature(String),
}

impl AuthError {
    /// Response body for every authentication failure.
    pub const PUBLIC_MESSAGE: &'static str = "authentication failed";
}

/// Extracts the token from an `Authorization` header value.
///
/// The value split on the word `Bearer` must yield an empty prefix and one
/// non-empty token.
pub fn parse_bearer(header: Option<&HeaderValue>) -> Result<&str, AuthError> {
    let raw = header
        .ok_or(AuthError::MissingHeader)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;

    let parts: Vec<&str> = raw.split("Bearer").collect();
    if parts.len() != 2 || !parts[0].trim().is_empty() {
        return Err(AuthError::MalformedHeader);
    }

    let token = parts[1].trim();
    if token.is_empty() {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

#[derive(Debug)]
enum Verification {
    Keys(Arc<JwksCache>),
    Disabled,
}

/// Resolves the caller identity from the `Authorization` header.
#[derive(Debug)]
pub struct IdentityResolver {
    verification: Verification,
    group_claim: String,
}

impl IdentityResolver {
    /// Verifies tokens against `keys`.
    pub fn new(keys: Arc<JwksCache>, group_claim: impl Into<String>) -> Self {
        Self {
            verification: Verification::Keys(keys),
            group_claim: group_claim.into(),
        }
    }

    /// Accepts any well-formed token without checking its signature.
    pub fn insecure(group_claim: impl Into<String>) -> Self {
        Self {
            verification: Verification::Disabled,
            group_claim: group_claim.into(),
        }
    }

    /// Returns true when signatures are not checked.
    pub fn is_insecure(&self) -> bool {
        matches!(self.verification, Verification::Disabled)
    }

    /// Returns the key cache, if tokens are verified.
    pub fn keys(&self) -> Option<&Arc<JwksCache>> {
        match &self.verification {
            Verification::Keys(keys) => Some(keys),
            Verification::Disabled => None,
        }
    }

    /// Authenticates the caller.
    pub async fn resolve(&self, header: Option<&HeaderValue>) -> Result<Identity, AuthError> {
        let token = parse_bearer(header)?;
        let claims = match &self.verification {
            Verification::Keys(keys) => keys.verify(token).await?,
            Verification::Disabled => {
                warn!("token signature verification is disabled");
                decode_claims(token)?
            }
        };
        Ok(Identity::from_claims(claims, &self.group_claim))
    }

    /// Returns false while the key set cannot be refreshed.
    pub fn is_healthy(&self) -> bool {
        match &self.verification {
            Verification::Keys(keys) => keys.is_healthy(),
            Verification::Disabled => true,
        }
    }
}

/// Decodes the claims segment of a JWT without verifying it.
fn decode_claims(token: &str) -> Result<Map<String, Value>, AuthError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(AuthError::MalformedToken("expected three segments".to_string())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| AuthError::MalformedToken(e.to_string()))
}
