//! Application state shared by all requests.
//!
//! Everything here is immutable after startup or swaps its own snapshots
//! internally, so handlers clone the `Arc`s and never lock.

use std::sync::Arc;

use gatekeep_labels::TenantProvider;
use gatekeep_query::Dialect;

use crate::auth::IdentityResolver;
use crate::config::ServerConfig;
use crate::dispatch::Upstream;
use crate::metrics::GatewayMetrics;

/// The metrics and log upstreams.
#[derive(Debug, Clone)]
pub struct Upstreams {
    /// Receives PromQL routes.
    pub metrics: Upstream,
    /// Receives LogQL routes.
    pub logs: Upstream,
}

impl Upstreams {
    /// Returns the upstream serving `dialect`.
    pub fn get(&self, dialect: Dialect) -> &Upstream {
        match dialect {
            Dialect::Promql => &self.metrics,
            Dialect::Logql => &self.logs,
        }
    }
}

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    config: Arc<ServerConfig>,
    identity: Arc<IdentityResolver>,
    tenants: Arc<dyn TenantProvider>,
    upstreams: Arc<Upstreams>,
    metrics: Arc<GatewayMetrics>,
}

impl AppState {
    /// Creates the state from its parts.
    pub fn new(
        config: ServerConfig,
        identity: IdentityResolver,
        tenants: Arc<dyn TenantProvider>,
        upstreams: Upstreams,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            config: Arc::new(config),
            identity: Arc::new(identity),
            tenants,
            upstreams: Arc::new(upstreams),
            metrics: Arc::new(metrics),
        }
    }

    /// Returns the configuration snapshot.
    pub fn config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    /// Returns the identity resolver.
    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    /// Returns the tenant provider.
    pub fn tenants(&self) -> &dyn TenantProvider {
        self.tenants.as_ref()
    }

    /// Returns the upstream serving `dialect`.
    pub fn upstream(&self, dialect: Dialect) -> &Upstream {
        self.upstreams.get(dialect)
    }

    /// Returns the request metrics.
    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Returns true when both the key set and the tenant provider are healthy.
    pub fn is_healthy(&self) -> bool {
        self.identity.is_healthy() && self.tenants.is_healthy()
    }
}
