//! Request metrics.
//!
//! Applied as a route layer so the matched route template is known, keeping
//! the `route` label bounded by the route table.

use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};

use crate::metrics::UNMATCHED_ROUTE;
use crate::state::AppState;

/// Middleware counting requests and timing them per route.
pub async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());
    let method = request.method().clone();

    let metrics = state.metrics();
    metrics.start(&route);
    let response = next.run(request).await;
    metrics.observe(
        &route,
        method.as_str(),
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}
