//! The enforced route table.
//!
//! | Path | Parameter | Dialect |
//! |------|-----------|---------|
//! | `/api/v1/query`, `/api/v1/query_range`, `/api/v1/format_query`, `/api/v1/query_exemplars`, `/api/v1/status/buildinfo` | `query` | PromQL |
//! | `/api/v1/series`, `/api/v1/labels`, `/api/v1/label/{name}/values` | `match[]` | PromQL |
//! | `/loki/api/v1/query`, `/loki/api/v1/query_range`, `/loki/api/v1/label/{name}/values`, `/loki/api/v1/labels`, `/loki/api/v1/tail`, `/loki/api/v1/index/stats` | `query` | LogQL |
//! | `/loki/api/v1/series` | `match[]` | LogQL |
//!
//! Every route accepts GET and POST.

use axum::routing::get;
use axum::{Extension, Router};
use gatekeep_query::Dialect;

use crate::pipeline;
use crate::state::AppState;

/// Parameter carrying an expression.
pub const QUERY_PARAM: &str = "query";

/// Parameter carrying series selectors.
pub const MATCH_PARAM: &str = "match[]";

/// An enforced endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    /// Path template.
    pub path: &'static str,
    /// Parameter holding the query.
    pub param: &'static str,
    /// Query language of the parameter.
    pub dialect: Dialect,
}

const fn metrics(path: &'static str, param: &'static str) -> Route {
    Route {
        path,
        param,
        dialect: Dialect::Promql,
    }
}

const fn logs(path: &'static str, param: &'static str) -> Route {
    Route {
        path,
        param,
        dialect: Dialect::Logql,
    }
}

/// All enforced routes.
pub static ROUTES: [Route; 15] = [
    metrics("/api/v1/query", QUERY_PARAM),
    metrics("/api/v1/query_range", QUERY_PARAM),
    metrics("/api/v1/format_query", QUERY_PARAM),
    metrics("/api/v1/query_exemplars", QUERY_PARAM),
    metrics("/api/v1/status/buildinfo", QUERY_PARAM),
    metrics("/api/v1/series", MATCH_PARAM),
    metrics("/api/v1/labels", MATCH_PARAM),
    metrics("/api/v1/label/{name}/values", MATCH_PARAM),
    logs("/loki/api/v1/query", QUERY_PARAM),
    logs("/loki/api/v1/query_range", QUERY_PARAM),
    logs("/loki/api/v1/label/{name}/values", QUERY_PARAM),
    logs("/loki/api/v1/labels", QUERY_PARAM),
    logs("/loki/api/v1/tail", QUERY_PARAM),
    logs("/loki/api/v1/index/stats", QUERY_PARAM),
    logs("/loki/api/v1/series", MATCH_PARAM),
];

/// Creates the proxy router with one GET/POST endpoint per route.
pub fn create_routes(state: AppState) -> Router {
    ROUTES
        .iter()
        .fold(Router::new(), |router, route| {
            router.route(
                route.path,
                get(pipeline::proxy_handler)
                    .post(pipeline::proxy_handler)
                    .layer(Extension(*route)),
            )
        })
        .with_state(state)
}
