//! The verified caller.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Claim holding the login name.
pub const USERNAME_CLAIM: &str = "preferred_username";

/// Claim holding the e-mail address.
pub const EMAIL_CLAIM: &str = "email";

/// Identity extracted from a verified token.
///
/// Missing or mistyped claims leave the corresponding field empty; the
/// identity is still usable, it just resolves to fewer tenants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// `preferred_username` claim.
    pub username: String,
    /// `email` claim.
    pub email: String,
    /// Group names from the configured group claim.
    pub groups: BTreeSet<String>,
    /// All claims as decoded.
    #[serde(default)]
    pub raw_claims: Map<String, Value>,
}

impl Identity {
    /// Builds an identity from decoded token claims.
    ///
    /// `group_claim` names the claim holding an array of group names.
    /// Non-string entries in that array are ignored.
    pub fn from_claims(claims: Map<String, Value>, group_claim: &str) -> Self {
        let string_claim = |name: &str| {
            claims
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let groups = claims
            .get(group_claim)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            username: string_claim(USERNAME_CLAIM),
            email: string_claim(EMAIL_CLAIM),
            groups,
            raw_claims: claims,
        }
    }

    /// Returns true if the identity belongs to `group`, ignoring case.
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g.eq_ignore_ascii_case(group))
    }
}
