//! HTTP handlers outside the enforced route table.
//!
//! - [`health`] - Liveness and readiness endpoints on the internal listener
//! - [`metrics`] - Prometheus exposition on the internal listener

pub mod health;
pub mod metrics;

pub use health::{health_handler, healthz_handler, readiness_handler};
pub use metrics::metrics_handler;
