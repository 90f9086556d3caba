//! Tenant labels from a SQL query.
//!
//! The configured query is run with every `?` placeholder bound to one
//! identity property. Each returned row's first column is a tenant.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params_from_iter;
use tracing::{debug, warn};

use crate::error::{LabelError, LabelResult};
use crate::identity::Identity;
use crate::provider::{ProviderKind, TenantDecision, TenantProvider};

/// Identity property bound to the query placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    /// The `email` claim.
    Email,
    /// The `preferred_username` claim.
    Username,
    /// Group names joined by `,`.
    Groups,
}

impl IdentityKey {
    /// Extracts the bound value from `identity`.
    pub fn value(&self, identity: &Identity) -> String {
        match self {
            IdentityKey::Email => identity.email.clone(),
            IdentityKey::Username => identity.username.clone(),
            IdentityKey::Groups => identity
                .groups
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl FromStr for IdentityKey {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(IdentityKey::Email),
            "preferredUsername" | "preferred_username" | "username" => Ok(IdentityKey::Username),
            "groups" => Ok(IdentityKey::Groups),
            other => Err(LabelError::UnsupportedIdentityKey(other.to_string())),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdentityKey::Email => "email",
            IdentityKey::Username => "preferredUsername",
            IdentityKey::Groups => "groups",
        })
    }
}

/// Label store that resolves tenants with a SQL query over a pooled SQLite
/// database.
///
/// Reports unhealthy after a failed lookup until a later lookup succeeds.
pub struct SqlLabelStore {
    pool: Pool<SqliteConnectionManager>,
    query: String,
    key: IdentityKey,
    healthy: AtomicBool,
}

impl fmt::Debug for SqlLabelStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlLabelStore")
            .field("query", &self.query)
            .field("key", &self.key)
            .field("connections", &self.pool.state().connections)
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SqlLabelStore {
    /// Opens the database at `path` with a pool of up to `max_connections`.
    pub fn open(
        path: impl AsRef<Path>,
        query: impl Into<String>,
        key: IdentityKey,
        max_connections: u32,
    ) -> LabelResult<Self> {
        let manager = SqliteConnectionManager::file(path.as_ref());
        Self::with_manager(manager, query, key, max_connections)
    }

    /// Builds a store over an existing connection manager.
    pub fn with_manager(
        manager: SqliteConnectionManager,
        query: impl Into<String>,
        key: IdentityKey,
        max_connections: u32,
    ) -> LabelResult<Self> {
        let pool = Pool::builder()
            .max_size(max_connections.max(1))
            .connection_timeout(Duration::from_secs(5))
            .build(manager)?;
        Ok(Self {
            pool,
            query: query.into(),
            key,
            healthy: AtomicBool::new(true),
        })
    }
}

fn lookup(
    pool: &Pool<SqliteConnectionManager>,
    query: &str,
    value: &str,
) -> LabelResult<Vec<String>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare_cached(query)?;
    let params = std::iter::repeat_n(value, stmt.parameter_count());
    let rows = stmt.query_map(params_from_iter(params), |row| row.get::<_, String>(0))?;
    let tenants = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(tenants)
}

#[async_trait]
impl TenantProvider for SqlLabelStore {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Sqlite
    }

    async fn tenants(&self, identity: &Identity) -> LabelResult<TenantDecision> {
        let value = self.key.value(identity);
        if value.is_empty() {
            warn!(key = %self.key, "identity has no value for the label lookup key");
        }

        let pool = self.pool.clone();
        let query = self.query.clone();
        let result = tokio::task::spawn_blocking(move || lookup(&pool, &query, &value))
            .await
            .map_err(LabelError::from)
            .and_then(|lookup| lookup);
        self.healthy.store(result.is_ok(), Ordering::Relaxed);

        let tenants = result.inspect_err(|e| warn!(error = %e, "tenant lookup failed"))?;
        debug!(count = tenants.len(), "resolved tenants from database");
        Ok(TenantDecision::scoped(tenants))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}
