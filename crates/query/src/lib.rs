//! # gatekeep-query
//!
//! Tenant scoping for PromQL and LogQL queries.
//!
//! A query is parsed into an AST, every selector in it is checked for a
//! matcher on the tenant label, and the query is written back out:
//!
//! - selectors that already carry a tenant matcher are accepted only when
//!   every value it names is an authorized tenant;
//! - selectors without one get a matcher for the full authorized set.
//!
//! Anything that does not parse is rejected.
//!
//! ```
//! use std::collections::BTreeSet;
//! use gatekeep_query::Dialect;
//!
//! let tenants = BTreeSet::from(["namespace1".to_string()]);
//! let scoped = Dialect::Promql.enforce("up", &tenants, "namespace").unwrap();
//! assert_eq!(scoped, r#"up{namespace="namespace1"}"#);
//! ```

#![warn(missing_docs)]

pub mod enforce;
pub mod error;
pub mod logql;
pub mod matcher;
pub mod ops;
pub mod promql;
mod syntax;

use std::collections::BTreeSet;
use std::fmt;

pub use enforce::{scope_matchers, tenant_matcher};
pub use error::{EnforceError, ParseError};
pub use matcher::{MatchOp, Matcher};

/// Query language of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Prometheus / Thanos query language.
    Promql,
    /// Loki log query language.
    Logql,
}

impl Dialect {
    /// Restricts `query` to `tenants` on the tenant `label`.
    pub fn enforce(
        &self,
        query: &str,
        tenants: &BTreeSet<String>,
        label: &str,
    ) -> Result<String, EnforceError> {
        match self {
            Dialect::Promql => promql::enforce(query, tenants, label),
            Dialect::Logql => logql::enforce(query, tenants, label),
        }
    }

    /// Query used in place of an empty one.
    pub fn default_query(&self) -> &'static str {
        match self {
            Dialect::Promql => promql::DEFAULT_QUERY,
            Dialect::Logql => logql::DEFAULT_QUERY,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Dialect::Promql => "PromQL",
            Dialect::Logql => "LogQL",
        })
    }
}
