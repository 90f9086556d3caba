//! Error types for tenant label resolution.

// Variant fields are described by their #[error(...)] messages
#![allow(missing_docs)]

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading label sources or resolving tenants.
#[derive(Error, Debug)]
pub enum LabelError {
    #[error("failed to read label file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid label file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[cfg(feature = "sqlite")]
    #[error("label database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[cfg(feature = "sqlite")]
    #[error("label query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("label lookup task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("unsupported identity key '{0}', expected email, preferredUsername or groups")]
    UnsupportedIdentityKey(String),

    #[error("unknown label store '{0}', expected static or sqlite")]
    UnknownStore(String),
}

/// Result alias for label operations.
pub type LabelResult<T> = Result<T, LabelError>;
