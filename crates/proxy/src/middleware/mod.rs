//! HTTP middleware for the proxy listener.
//!
//! - [`logging`] - Request logging with credential redaction
//! - [`metrics`] - Per-route request counters and latency

pub mod logging;
pub mod metrics;

pub use logging::{RedactedHeaders, log_request};
pub use metrics::track_metrics;
