//! # gatekeep-labels
//!
//! Maps a verified caller to the tenants it may query.
//!
//! - [`Identity`] is the caller as read from a token's claims.
//! - [`TenantProvider`] resolves an identity to a [`TenantDecision`].
//! - [`StaticLabelStore`] reads users and groups from a YAML file and
//!   reloads it when it changes.
//! - `SqlLabelStore` (feature `sqlite`) runs a parameterized query.
//!
//! ```
//! use gatekeep_labels::{Identity, LabelMap};
//!
//! let map = LabelMap::from_yaml("groups:\n  dev: [team-a]\n").unwrap();
//! let identity = Identity {
//!     username: "alice".into(),
//!     groups: ["Dev".to_string()].into(),
//!     ..Default::default()
//! };
//! let decision = map.resolve(&identity);
//! assert!(decision.tenants.contains("team-a"));
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod identity;
pub mod provider;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod static_map;

pub use error::{LabelError, LabelResult};
pub use identity::Identity;
pub use provider::{CLUSTER_WIDE, ProviderKind, TenantDecision, TenantProvider};
#[cfg(feature = "sqlite")]
pub use sqlite::{IdentityKey, SqlLabelStore};
pub use static_map::{LabelMap, StaticLabelStore};
