//! Error types for query parsing and tenant enforcement.

use thiserror::Error;

use crate::Dialect;

/// A query could not be parsed in its dialect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {dialect} query: {message}")]
pub struct ParseError {
    /// Dialect the query was parsed as.
    pub dialect: Dialect,
    /// Parser diagnostics, joined.
    pub message: String,
}

impl ParseError {
    pub(crate) fn from_rich<'src>(
        dialect: Dialect,
        errors: Vec<chumsky::error::Rich<'src, char>>,
    ) -> Self {
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self { dialect, message }
    }
}

/// Reasons a query is refused by the enforcer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnforceError {
    /// The caller is authorized for no tenant at all.
    #[error("no tenant labels found")]
    NoTenants,

    /// The query references a tenant value outside the authorized set, or a
    /// tenant matcher that is not a plain list of values.
    #[error("unauthorized {label} {value}")]
    Unauthorized {
        /// Tenant label name.
        label: String,
        /// Offending value as written in the query.
        value: String,
    },

    /// The query has no selector the tenant matcher could be attached to.
    #[error("query contains no selector to scope")]
    NoSelector,

    /// The query failed to parse.
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl EnforceError {
    /// Returns true when the query was rejected for syntax rather than policy.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, EnforceError::Parse(_))
    }
}
