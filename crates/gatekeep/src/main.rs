//! gatekeep - multi-tenant authorization gateway for Thanos and Loki.
//!
//! Starts the proxy listener and the internal health listener. See
//! [`gatekeep_proxy::config`] for configuration.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use clap::Parser;
use gatekeep_labels::{ProviderKind, StaticLabelStore, TenantProvider};
use gatekeep_proxy::{
    AppState, GatewayMetrics, IdentityResolver, JwksCache, ServerConfig, TlsOptions, Upstream,
    Upstreams, create_app, create_internal_app, init_logging,
};
use gatekeep_query::Dialect;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_logging(&config.log_level);

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    info!(
        port = config.port,
        internal_port = config.internal_port,
        host = %config.host,
        label_store = %config.label_store,
        dev_mode = config.dev_mode,
        admin_bypass = config.admin_bypass,
        "Starting gatekeep"
    );

    let mut tasks = Vec::new();

    let service_token = read_service_token(&config)?;
    let tls = TlsOptions::load(config.trusted_root_ca.as_deref(), config.tls_verify_skip)?;
    if config.tls_verify_skip {
        warn!("Upstream TLS certificate verification is disabled");
    }

    let tenants = create_tenant_provider(&config, &mut tasks)?;
    let identity = create_identity_resolver(&config, &tls, &mut tasks).await?;
    let upstreams = Upstreams {
        metrics: Upstream::from_settings(
            &config.upstream(Dialect::Promql),
            &tls,
            service_token.as_deref(),
        )
        .context("invalid metrics upstream")?,
        logs: Upstream::from_settings(
            &config.upstream(Dialect::Logql),
            &tls,
            service_token.as_deref(),
        )
        .context("invalid logs upstream")?,
    };

    let metrics = GatewayMetrics::new().context("failed to register metrics")?;
    let state = AppState::new(config.clone(), identity, tenants, upstreams, metrics);
    let result = serve(state, &config).await;

    for task in tasks {
        task.abort();
    }
    info!("Shut down");
    result
}

/// Reads the service token when an upstream uses mutual auth.
fn read_service_token(config: &ServerConfig) -> anyhow::Result<Option<String>> {
    if !config.needs_service_token() {
        return Ok(None);
    }
    if let Some(token) = &config.service_account_token {
        return Ok(Some(token.trim().to_string()));
    }
    let path = &config.service_account_token_path;
    let token = fs::read_to_string(path)
        .with_context(|| format!("failed to read service account token from {}", path))?;
    Ok(Some(token.trim().to_string()))
}

/// Builds the tenant provider named by `--label-store`.
fn create_tenant_provider(
    config: &ServerConfig,
    tasks: &mut Vec<JoinHandle<()>>,
) -> anyhow::Result<Arc<dyn TenantProvider>> {
    match config.label_store.parse::<ProviderKind>()? {
        ProviderKind::Static => {
            info!(path = %config.labels_file, "Loading tenant labels");
            let store = Arc::new(StaticLabelStore::load(&config.labels_file)?);
            tasks.push(
                Arc::clone(&store)
                    .spawn_watcher(Duration::from_secs(config.labels_reload_interval)),
            );
            Ok(store as Arc<dyn TenantProvider>)
        }
        ProviderKind::Sqlite => create_sqlite_provider(config),
    }
}

#[cfg(feature = "sqlite")]
fn create_sqlite_provider(config: &ServerConfig) -> anyhow::Result<Arc<dyn TenantProvider>> {
    use gatekeep_labels::{IdentityKey, SqlLabelStore};

    let path = config
        .sqlite_path
        .as_deref()
        .context("the sqlite label store needs a database path")?;
    let query = config
        .sqlite_query
        .as_deref()
        .context("the sqlite label store needs a query")?;
    let key: IdentityKey = config.sqlite_identity_key.parse()?;

    info!(database = %path, identity_key = %config.sqlite_identity_key, "Opening SQLite label store");
    let store = SqlLabelStore::open(path, query, key, config.sqlite_max_connections)?;
    Ok(Arc::new(store) as Arc<dyn TenantProvider>)
}

/// Fallback when the sqlite feature is not enabled.
#[cfg(not(feature = "sqlite"))]
fn create_sqlite_provider(_config: &ServerConfig) -> anyhow::Result<Arc<dyn TenantProvider>> {
    anyhow::bail!(
        "The sqlite label store requires the 'sqlite' feature. \
         Build with: cargo build -p gatekeep --features sqlite"
    )
}

/// Builds the identity resolver and starts the key refresh task.
async fn create_identity_resolver(
    config: &ServerConfig,
    tls: &TlsOptions,
    tasks: &mut Vec<JoinHandle<()>>,
) -> anyhow::Result<IdentityResolver> {
    if config.dev_mode {
        warn!("Dev mode: token signatures are NOT verified");
        return Ok(IdentityResolver::insecure(config.group_claim.clone()));
    }

    let keys = match &config.jwks_url {
        Some(url) => {
            let url = Url::parse(url).with_context(|| format!("invalid key set URL {}", url))?;
            let client = tls.client_builder()?.build()?;
            let cache = Arc::new(JwksCache::remote(
                url,
                client,
                Duration::from_secs(config.jwks_timeout),
                Duration::from_secs(config.jwks_min_refresh_interval),
                config.jwks_static.as_deref(),
            )?);
            let count = cache
                .refresh()
                .await
                .context("initial key set fetch failed")?;
            info!(keys = count, "Loaded key set");
            tasks.push(
                Arc::clone(&cache).spawn_refresh(Duration::from_secs(config.jwks_refresh_interval)),
            );
            cache
        }
        None => {
            let document = config
                .jwks_static
                .as_deref()
                .context("a key set URL or static key set is required")?;
            let cache = JwksCache::from_static(document)?;
            info!(keys = cache.len(), "Loaded static key set");
            Arc::new(cache)
        }
    };

    Ok(IdentityResolver::new(keys, config.group_claim.clone()))
}

/// Serves the proxy and internal listeners until shutdown.
async fn serve(state: AppState, config: &ServerConfig) -> anyhow::Result<()> {
    let app = create_app(state.clone());
    let internal = create_internal_app(state);

    let proxy = listen(app, config.socket_addr(), "Proxy");
    let health = listen(internal, config.internal_socket_addr(), "Internal");
    tokio::try_join!(proxy, health)?;
    Ok(())
}

async fn listen(app: Router, addr: String, name: &'static str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(address = %addr, "{} server listening", name);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
