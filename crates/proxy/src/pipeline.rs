//! Per-request authorization pipeline.
//!
//! `authenticate -> admin bypass -> resolve tenants -> enforce -> forward`.
//! Each step either passes a [`RequestScope`] along or ends the request with a
//! [`GatewayError`]; nothing is forwarded after a failure.
//!
//! Enforcement rewrites every occurrence of the route's parameter in the URL
//! query and, for form-encoded POST bodies, in the body. When the parameter
//! appears nowhere, the dialect's default query is enforced and appended to
//! the URL so the upstream still only sees the caller's tenants.

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Extension;
use bytes::Bytes;
use gatekeep_labels::{Identity, TenantDecision};
use gatekeep_query::EnforceError;
use http::request::Parts;
use http::{HeaderMap, Method, header};
use tracing::{debug, info};
use url::form_urlencoded;

use crate::config::ServerConfig;
use crate::dispatch::{ClientUpgrade, Outbound};
use crate::error::{GatewayError, GatewayResult};
use crate::routes::Route;
use crate::state::AppState;

/// What the pipeline knows about a request after authorization.
#[derive(Debug, Clone)]
pub struct RequestScope {
    /// The matched route.
    pub route: Route,
    /// The authenticated caller.
    pub identity: Identity,
    /// Tenants the caller may see.
    pub decision: TenantDecision,
    /// Forward without enforcement.
    pub skip: bool,
}

/// Handles every enforced route.
pub async fn proxy_handler(
    State(state): State<AppState>,
    Extension(route): Extension<Route>,
    request: Request,
) -> GatewayResult<Response> {
    let config = state.config();
    let (mut parts, body) = request.into_parts();
    let upgrade = ClientUpgrade::take(&mut parts);

    let identity = state
        .identity()
        .resolve(parts.headers.get(header::AUTHORIZATION))
        .await?;
    let scope = authorize(&state, &config, route, identity).await?;

    let body = axum::body::to_bytes(body, config.max_body_size)
        .await
        .map_err(|e| GatewayError::Forbidden(format!("failed to read request body: {}", e)))?;

    let upstream = state.upstream(route.dialect);
    let (query, body) = if scope.skip {
        (parts.uri.query().map(str::to_string), body)
    } else {
        enforce_request(&scope, &parts, body, &upstream.target().tenant_label)?
    };

    let outbound = Outbound {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query,
        headers: parts.headers,
        body,
        upgrade,
    };
    upstream.forward(outbound, &scope.identity).await
}

/// Decides whether and how the caller's queries are scoped.
pub async fn authorize(
    state: &AppState,
    config: &ServerConfig,
    route: Route,
    identity: Identity,
) -> GatewayResult<RequestScope> {
    if config.admin_bypass && identity.in_group(&config.admin_group) {
        info!(user = %identity.username, path = route.path, "admin bypass");
        return Ok(RequestScope {
            route,
            identity,
            decision: TenantDecision::admin(),
            skip: true,
        });
    }

    let decision = state.tenants().tenants(&identity).await?;
    debug!(
        user = %identity.username,
        tenants = ?decision.tenants,
        cluster_wide = decision.cluster_wide,
        "resolved tenants"
    );
    Ok(RequestScope {
        route,
        identity,
        skip: !decision.requires_enforcement(),
        decision,
    })
}

/// Enforces the query parameter in the URL and, for POST, in the form body.
///
/// Returns the new query string and body.
pub fn enforce_request(
    scope: &RequestScope,
    parts: &Parts,
    body: Bytes,
    tenant_label: &str,
) -> GatewayResult<(Option<String>, Bytes)> {
    let route = scope.route;
    let enforce = |query: &str| {
        route
            .dialect
            .enforce(query, &scope.decision.tenants, tenant_label)
    };

    let mut in_body = false;
    let body = if parts.method == Method::POST {
        if body.is_empty() {
            body
        } else if is_form(&parts.headers) {
            match enforce_params(&body, route.param, enforce)? {
                Some(form) => {
                    in_body = true;
                    Bytes::from(form)
                }
                None => body,
            }
        } else {
            return Err(GatewayError::Forbidden(
                "unsupported request body content type".to_string(),
            ));
        }
    } else {
        Bytes::new()
    };

    let raw = parts.uri.query().unwrap_or_default();
    let query = match enforce_params(raw.as_bytes(), route.param, enforce)? {
        Some(query) => query,
        None if in_body => raw.to_string(),
        None => append_param(raw, route.param, &enforce("")?),
    };
    debug!(path = route.path, query = %query, "enforced request");
    Ok((Some(query), body))
}

/// Rewrites every `param` pair in a form-encoded input with `enforce`.
///
/// Returns `None` when `param` does not occur.
fn enforce_params<F>(input: &[u8], param: &str, enforce: F) -> Result<Option<String>, EnforceError>
where
    F: Fn(&str) -> Result<String, EnforceError>,
{
    let mut found = false;
    let pairs = form_urlencoded::parse(input)
        .map(|(key, value)| {
            if key == param {
                found = true;
                enforce(&value).map(|value| (key.into_owned(), value))
            } else {
                Ok((key.into_owned(), value.into_owned()))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    if !found {
        return Ok(None);
    }
    let encoded = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    Ok(Some(encoded))
}

fn append_param(query: &str, param: &str, value: &str) -> String {
    form_urlencoded::Serializer::for_suffix(query.to_string(), 0)
        .append_pair(param, value)
        .finish()
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<mime::Mime>().ok())
        .is_some_and(|m| m.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str())
}
