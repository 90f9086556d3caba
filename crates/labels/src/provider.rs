//! Tenant decisions and the provider trait implemented by each label source.

use std::collections::BTreeSet;
use std::fmt::{self, Debug};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LabelError, LabelResult};
use crate::identity::Identity;

/// Tenant value granting access to every tenant.
pub const CLUSTER_WIDE: &str = "#cluster-wide";

/// Which tenants a caller may see.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDecision {
    /// Authorized tenant label values.
    pub tenants: BTreeSet<String>,
    /// The caller is exempt from tenant scoping.
    pub cluster_wide: bool,
    /// The caller was exempted as an administrator.
    pub is_admin: bool,
}

impl TenantDecision {
    /// A decision limited to `tenants`.
    pub fn scoped(tenants: impl IntoIterator<Item = String>) -> Self {
        Self {
            tenants: tenants.into_iter().collect(),
            ..Self::default()
        }
    }

    /// A decision exempt from scoping.
    pub fn cluster_wide() -> Self {
        Self {
            cluster_wide: true,
            ..Self::default()
        }
    }

    /// A cluster-wide decision granted through the admin group.
    pub fn admin() -> Self {
        Self {
            cluster_wide: true,
            is_admin: true,
            ..Self::default()
        }
    }

    /// Returns true when queries must be rewritten.
    pub fn requires_enforcement(&self) -> bool {
        !self.cluster_wide
    }
}

/// The kind of label source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// YAML user and group map.
    Static,
    /// SQL lookup.
    Sqlite,
}

impl ProviderKind {
    /// Returns the configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Static => "static",
            ProviderKind::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "static" | "configmap" => Ok(ProviderKind::Static),
            "sqlite" | "sql" => Ok(ProviderKind::Sqlite),
            _ => Err(LabelError::UnknownStore(s.to_string())),
        }
    }
}

/// A source of tenant labels.
///
/// Implementations are shared across concurrent requests and must not block
/// the async runtime.
#[async_trait]
pub trait TenantProvider: Send + Sync + Debug {
    /// Returns the kind of this provider.
    fn kind(&self) -> ProviderKind;

    /// Resolves the tenants visible to `identity`.
    async fn tenants(&self, identity: &Identity) -> LabelResult<TenantDecision>;

    /// Returns false while the provider cannot serve fresh data.
    fn is_healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let scoped = TenantDecision::scoped(["b".to_string(), "a".to_string(), "a".to_string()]);
        assert_eq!(scoped.tenants.len(), 2);
        assert!(scoped.requires_enforcement());

        assert!(!TenantDecision::cluster_wide().requires_enforcement());
        let admin = TenantDecision::admin();
        assert!(admin.is_admin && admin.cluster_wide);
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("static".parse::<ProviderKind>().unwrap(), ProviderKind::Static);
        assert_eq!("SQLite".parse::<ProviderKind>().unwrap(), ProviderKind::Sqlite);
        assert!(matches!(
            "mysql".parse::<ProviderKind>(),
            Err(LabelError::UnknownStore(s)) if s == "mysql"
        ));
    }
}
