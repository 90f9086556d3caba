//! Prometheus metrics for the proxy listener.
//!
//! Each gateway owns its registry, so several gateways in one process (as in
//! tests) never collide on metric names. The internal listener exposes it at
//! `/metrics` in the text exposition format.

use std::fmt;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

/// Label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Request counters and latency histograms labelled by route.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: HistogramVec,
    inflight: IntGaugeVec,
}

impl GatewayMetrics {
    /// Creates the collectors and registers them in a fresh registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new(
                "gatekeep_http_requests_total",
                "Requests handled by the proxy listener",
            ),
            &["route", "method", "status"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "gatekeep_http_request_duration_seconds",
                "Latency of requests handled by the proxy listener",
            ),
            &["route", "method", "status"],
        )?;
        let inflight = IntGaugeVec::new(
            Opts::new(
                "gatekeep_http_requests_inflight",
                "Requests currently being handled",
            ),
            &["route"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(inflight.clone()))?;

        Ok(Self {
            registry,
            requests,
            duration,
            inflight,
        })
    }

    /// Marks a request on `route` as started.
    pub fn start(&self, route: &str) {
        self.inflight.with_label_values(&[route]).inc();
    }

    /// Records a finished request.
    pub fn observe(&self, route: &str, method: &str, status: u16, seconds: f64) {
        let status = status.to_string();
        let labels = [route, method, status.as_str()];
        self.inflight.with_label_values(&[route]).dec();
        self.requests.with_label_values(&labels).inc();
        self.duration.with_label_values(&labels).observe(seconds);
    }

    /// Encodes every collector in the text exposition format.
    pub fn encode(&self) -> prometheus::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}
