//! Tenant scoping of matcher lists.
//!
//! Every selector must end up with a positive matcher on the tenant label
//! whose values are all inside the caller's tenant set:
//!
//! - an `=` matcher must name an authorized tenant;
//! - an `=~` matcher must be a plain alternation `a|b|c` of authorized
//!   tenants (metacharacters only when backslash-escaped);
//! - when neither is present, `label="t"` (one tenant) or `label=~"t1|t2"`
//!   (several, sorted) is appended.
//!
//! Negative matchers on the tenant label only narrow a selection, so they
//! are kept and do not count as scoping.

use std::collections::BTreeSet;

use crate::error::EnforceError;
use crate::matcher::{MatchOp, Matcher};

const REGEX_META: &[char] = &[
    '\\', '.', '+', '*', '?', '(', ')', '|', '[', ']', '{', '}', '^', '$',
];

/// A parsed query whose selectors can be scoped.
pub(crate) trait ScopedExpr {
    /// Matcher lists of every selector in the expression.
    fn matcher_sets(&mut self) -> Vec<&mut Vec<Matcher>>;
}

/// Scopes every selector of `expr`. Fails if there is no selector at all.
pub(crate) fn scope_selectors<E: ScopedExpr>(
    expr: &mut E,
    tenants: &BTreeSet<String>,
    label: &str,
) -> Result<(), EnforceError> {
    if tenants.is_empty() {
        return Err(EnforceError::NoTenants);
    }
    let sets = expr.matcher_sets();
    if sets.is_empty() {
        return Err(EnforceError::NoSelector);
    }
    for matchers in sets {
        scope_matchers(matchers, tenants, label)?;
    }
    Ok(())
}

/// Validates the tenant matchers in `matchers`, appending one if none scopes
/// the selector.
pub fn scope_matchers(
    matchers: &mut Vec<Matcher>,
    tenants: &BTreeSet<String>,
    label: &str,
) -> Result<(), EnforceError> {
    if tenants.is_empty() {
        return Err(EnforceError::NoTenants);
    }

    let mut scoped = false;
    for matcher in matchers.iter().filter(|m| m.name == label) {
        match matcher.op {
            MatchOp::Equal => {
                if !tenants.contains(&matcher.value) {
                    return Err(unauthorized(label, &matcher.value));
                }
                scoped = true;
            }
            MatchOp::RegexMatch => {
                let values =
                    literal_alternatives(&matcher.value).map_err(|raw| unauthorized(label, raw))?;
                if let Some(value) = values.iter().find(|v| !tenants.contains(*v)) {
                    return Err(unauthorized(label, value));
                }
                scoped = true;
            }
            MatchOp::NotEqual | MatchOp::RegexNoMatch => {}
        }
    }

    if !scoped {
        matchers.push(tenant_matcher(tenants, label));
    }
    Ok(())
}

/// The matcher selecting exactly `tenants`.
pub fn tenant_matcher(tenants: &BTreeSet<String>, label: &str) -> Matcher {
    if tenants.len() == 1 {
        let value = tenants.iter().next().cloned().unwrap_or_default();
        return Matcher::new(label, MatchOp::Equal, value);
    }
    let value = tenants
        .iter()
        .map(|t| escape_regex(t))
        .collect::<Vec<_>>()
        .join("|");
    Matcher::new(label, MatchOp::RegexMatch, value)
}

fn unauthorized(label: &str, value: &str) -> EnforceError {
    EnforceError::Unauthorized {
        label: label.to_string(),
        value: value.to_string(),
    }
}

fn escape_regex(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if REGEX_META.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Splits an anchored regex into its literal alternatives. Returns the raw
/// text of the first alternative that is not a plain literal.
fn literal_alternatives(regex: &str) -> Result<Vec<String>, &str> {
    let mut values = Vec::new();
    for raw in split_alternatives(regex) {
        let mut value = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(next) if REGEX_META.contains(&next) => value.push(next),
                    _ => return Err(raw),
                },
                c if REGEX_META.contains(&c) => return Err(raw),
                c => value.push(c),
            }
        }
        values.push(value);
    }
    Ok(values)
}

/// Splits on `|` that is not preceded by a backslash escape.
fn split_alternatives(regex: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in regex.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '|' => {
                parts.push(&regex[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&regex[start..]);
    parts
}
