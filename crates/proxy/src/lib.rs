//! # gatekeep-proxy - Tenant-Enforcing Query Gateway
//!
//! This crate is the HTTP side of gatekeep: an authorization gateway placed in
//! front of a Thanos (PromQL) and a Loki (LogQL) backend. Every request is
//! authenticated with a JWT, mapped to the tenants the caller may see, and
//! its query rewritten so the backend only returns those tenants' data.
//!
//! ## Request Flow
//!
//! 1. The bearer token is verified against a rotating JWKS
//!    ([`auth::JwksCache`]).
//! 2. Members of the admin group skip enforcement when admin bypass is on.
//! 3. The tenant provider resolves the caller's tenants; the `#cluster-wide`
//!    marker skips enforcement.
//! 4. The route's query parameter is rewritten in the URL and in form-encoded
//!    POST bodies ([`pipeline`]).
//! 5. The request is forwarded to the upstream for the route's dialect
//!    ([`dispatch`]).
//!
//! Any authentication or enforcement failure ends the request with
//! `403 Forbidden` and a short plaintext body.
//!
//! ## Endpoints
//!
//! The proxy listener serves the enforced routes listed in [`routes`]. The
//! internal listener serves probes:
//!
//! | Endpoint | Response |
//! |----------|----------|
//! | `/healthz` | `200 Ok` or `500 Unhealthy` |
//! | `/health` | JSON health report |
//! | `/ready` | `200` or `503` |
//! | `/metrics` | Prometheus text exposition |
//!
//! ## Configuration
//!
//! See [`config`] for the environment variables.
//!
//! ## Architecture
//!
//! - [`auth`] - Bearer parsing, JWKS cache and identity resolution
//! - [`config`] - Server configuration
//! - [`dispatch`] - Upstream clients and header policy
//! - [`error`] - Gateway errors and their responses
//! - [`handlers`] - Health and metrics endpoints
//! - [`metrics`] - Prometheus collectors
//! - [`middleware`] - Request logging and metrics
//! - [`pipeline`] - Authorization and enforcement per request
//! - [`routes`] - Enforced route table
//! - [`state`] - Shared application state

// Enforce documentation
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod routes;
pub mod state;

// Re-export commonly used types
pub use auth::{AuthError, IdentityResolver, JwksCache};
pub use config::ServerConfig;
pub use dispatch::{TlsOptions, Upstream, UpstreamTarget};
pub use error::{GatewayError, GatewayResult};
pub use metrics::GatewayMetrics;
pub use state::{AppState, Upstreams};

use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;

/// Creates the proxy application serving the enforced routes.
///
/// # Example
///
/// ```rust,ignore
/// use gatekeep_proxy::{create_app, AppState};
///
/// let app = create_app(state);
/// let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
/// axum::serve(listener, app).await?;
/// ```
pub fn create_app(state: AppState) -> Router {
    let config = state.config();
    info!(
        label_store = %state.tenants().kind(),
        metrics_upstream = %state.upstream(gatekeep_query::Dialect::Promql).target().base_url,
        logs_upstream = %state.upstream(gatekeep_query::Dialect::Logql).target().base_url,
        "Creating gateway router"
    );

    let router = routes::create_routes(state.clone())
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::track_metrics,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state,
            middleware::log_request,
        ));

    let service_builder = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            Duration::from_secs(config.request_timeout),
        ))
        .layer(PropagateRequestIdLayer::x_request_id());

    router.layer(service_builder)
}

/// Creates the internal application serving health probes and metrics.
pub fn create_internal_app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz_handler))
        .route("/health", get(handlers::health_handler))
        .route("/ready", get(handlers::readiness_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
}

/// Initializes the tracing subscriber for logging.
///
/// This should be called once at application startup. `RUST_LOG` overrides
/// `level` when set.
pub fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "gatekeep={level},gatekeep_proxy={level},gatekeep_labels={level},gatekeep_query={level},tower_http=debug"
        ))
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
