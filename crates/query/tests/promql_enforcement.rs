//! PromQL tenant enforcement tests.

use std::collections::BTreeSet;

use gatekeep_query::promql::{self, Expr};
use gatekeep_query::{Dialect, EnforceError};

const LABEL: &str = "namespace";

fn tenants(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(ToString::to_string).collect()
}

fn enforce(query: &str, allowed: &[&str]) -> Result<String, EnforceError> {
    Dialect::Promql.enforce(query, &tenants(allowed), LABEL)
}

// ============================================================================
// Injection
// ============================================================================

#[test]
fn test_single_tenant_injects_equality() {
    assert_eq!(
        enforce("up", &["namespace1"]).unwrap(),
        r#"up{namespace="namespace1"}"#
    );
}

#[test]
fn test_multiple_tenants_inject_regex() {
    assert_eq!(enforce("up", &["a", "b"]).unwrap(), r#"up{namespace=~"a|b"}"#);
    assert_eq!(enforce("up", &["b", "a"]).unwrap(), r#"up{namespace=~"a|b"}"#);
}

#[test]
fn test_empty_query_uses_default_selector() {
    assert_eq!(
        enforce("", &["t"]).unwrap(),
        r#"{__name__=~".+", namespace="t"}"#
    );
    assert_eq!(
        enforce("  ", &["t1", "t2"]).unwrap(),
        r#"{__name__=~".+", namespace=~"t1|t2"}"#
    );
}

#[test]
fn test_every_selector_is_scoped() {
    assert_eq!(
        enforce(
            r#"sum(rate(http_requests_total{code=~"5.."}[5m])) by (job) / on (job) sum by (job) (rate(http_requests_total[5m]))"#,
            &["ns1"]
        )
        .unwrap(),
        r#"sum by (job) (rate(http_requests_total{code=~"5..", namespace="ns1"}[5m])) / on (job) sum by (job) (rate(http_requests_total{namespace="ns1"}[5m]))"#
    );
}

#[test]
fn test_subquery_and_modifiers_preserved() {
    assert!(enforce("max_over_time(rate(x[1m])[1h:5m]) offset -5m", &["ns1"]).is_err());
    assert_eq!(
        enforce("max_over_time(rate(x[1m] offset 5m)[1h:5m] @ end())", &["ns1"]).unwrap(),
        r#"max_over_time(rate(x{namespace="ns1"}[1m] offset 5m)[1h:5m] @ end())"#
    );
}

#[test]
fn test_negative_tenant_matcher_is_kept_and_scoped() {
    assert_eq!(
        enforce(r#"up{namespace!="b"}"#, &["a", "b"]).unwrap(),
        r#"up{namespace!="b", namespace=~"a|b"}"#
    );
}

// ============================================================================
// Existing tenant matchers
// ============================================================================

#[test]
fn test_authorized_matcher_left_unchanged() {
    assert_eq!(
        enforce(r#"up{namespace="a"}"#, &["a", "b"]).unwrap(),
        r#"up{namespace="a"}"#
    );
    assert_eq!(
        enforce(r#"up{namespace=~"b|a"}"#, &["a", "b", "c"]).unwrap(),
        r#"up{namespace=~"b|a"}"#
    );
}

#[test]
fn test_unauthorized_value_is_named() {
    let err = enforce(r#"up{namespace="ns2"}"#, &["namespace1"]).unwrap_err();
    assert_eq!(
        err,
        EnforceError::Unauthorized {
            label: LABEL.to_string(),
            value: "ns2".to_string()
        }
    );
    assert_eq!(err.to_string(), "unauthorized namespace ns2");
}

#[test]
fn test_unauthorized_value_in_any_selector_rejects_query() {
    let err = enforce(r#"up{namespace="a"} + up{namespace="z"}"#, &["a"]).unwrap_err();
    assert_eq!(err.to_string(), "unauthorized namespace z");
}

#[test]
fn test_wildcard_regex_rejected() {
    for query in [
        r#"up{namespace=~".*"}"#,
        r#"up{namespace=~"a.*"}"#,
        r#"up{namespace=~"a|.+"}"#,
    ] {
        assert!(
            matches!(enforce(query, &["a"]), Err(EnforceError::Unauthorized { .. })),
            "{query} should be rejected"
        );
    }
}

// ============================================================================
// Failure modes
// ============================================================================

#[test]
fn test_no_tenants_rejected() {
    assert_eq!(enforce("up", &[]), Err(EnforceError::NoTenants));
}

#[test]
fn test_query_without_selector_rejected() {
    assert_eq!(enforce("1 + 1", &["a"]), Err(EnforceError::NoSelector));
    assert_eq!(enforce("vector(1)", &["a"]), Err(EnforceError::NoSelector));
    assert_eq!(enforce(r#""text""#, &["a"]), Err(EnforceError::NoSelector));
}

#[test]
fn test_parse_errors_fail_closed() {
    for query in ["up{", "sum(", "up}", r#"up{namespace="a""#, "up ==", "rate(x[5m)"] {
        let err = enforce(query, &["a"]).unwrap_err();
        assert!(err.is_parse_error(), "{query}: {err}");
        assert!(err.to_string().starts_with("invalid PromQL query"));
    }
}

#[test]
fn test_invalid_byte_escape_fails_closed() {
    let err = enforce(r#"up{job="\xff"}"#, &["a"]).unwrap_err();
    assert!(err.is_parse_error(), "{err}");
}

// ============================================================================
// String escapes
// ============================================================================

#[test]
fn test_hex_escape_is_decoded() {
    assert_eq!(
        enforce(r#"up{job="\x41"}"#, &["namespace1"]).unwrap(),
        r#"up{job="A", namespace="namespace1"}"#
    );
}

#[test]
fn test_octal_and_long_unicode_escapes_are_decoded() {
    assert_eq!(
        enforce(r#"up{job="\101\U00000042"}"#, &["t"]).unwrap(),
        r#"up{job="AB", namespace="t"}"#
    );
}

#[test]
fn test_escaped_tenant_value_is_checked_decoded() {
    // `\x61` is `a`, so the matcher names an authorized tenant.
    assert_eq!(
        enforce(r#"up{namespace="\x61"}"#, &["a", "b"]).unwrap(),
        r#"up{namespace="a"}"#
    );
    let err = enforce(r#"up{namespace="\x63"}"#, &["a", "b"]).unwrap_err();
    assert_eq!(err.to_string(), "unauthorized namespace c");
}

#[test]
fn test_control_characters_are_re_escaped() {
    let once = enforce(r#"up{job="a\x00b\x1f"}"#, &["t"]).unwrap();
    assert_eq!(once, r#"up{job="a\u0000b\u001f", namespace="t"}"#);
    assert_eq!(enforce(&once, &["t"]).unwrap(), once);
}

// ============================================================================
// Properties
// ============================================================================

const QUERIES: &[&str] = &[
    "up",
    r#"{__name__=~".+"}"#,
    r#"http_requests_total{job="api", code!~"2.."}"#,
    "sum by (job) (rate(http_requests_total[5m] offset 1h))",
    "sum without (instance) (x)",
    "histogram_quantile(0.9, sum by (le) (rate(x_bucket[5m])))",
    "a + on (job) group_left (instance) b",
    "a * ignoring (instance) group_right b",
    "-x ^ 2 > bool 3",
    "2 ^ 3 ^ 2",
    "(a + b) * c",
    "topk(5, x) unless y",
    r#"count_values("version", build_info)"#,
    "x @ 1609746000 offset -5m",
    "rate(x[5m] @ start())",
    "max_over_time(deriv(x[1m])[1h:])",
    "quantile(0.5, x) or vector(0)",
    "0x1F + Inf - 1e3",
    r#"label_replace(up, "dst", "$1", "src", "(.*)")"#,
];

#[test]
fn test_round_trip_preserves_structure() {
    for query in QUERIES {
        let parsed = promql::parse(query).unwrap();
        let reparsed = promql::parse(&parsed.to_string()).unwrap();
        assert_eq!(parsed, reparsed, "{query}");
    }
}

#[test]
fn test_enforcement_is_idempotent() {
    for allowed in [&["a"][..], &["a", "b"][..], &["team.x", "team.y"][..]] {
        let scoped = QUERIES
            .iter()
            .filter(|q| !promql::parse(q).unwrap().selectors_mut().is_empty());
        for query in scoped {
            let once = enforce(query, allowed).unwrap();
            let twice = enforce(&once, allowed).unwrap();
            assert_eq!(once, twice, "{query}");
        }
    }
}

#[test]
fn test_injected_matcher_lists_each_tenant_once() {
    let rewritten = enforce("up", &["c", "a", "b"]).unwrap();
    let Expr::Selector(selector) = promql::parse(&rewritten).unwrap() else {
        panic!("expected selector");
    };
    let values: Vec<&str> = selector.matchers[0].value.split('|').collect();
    assert_eq!(values, vec!["a", "b", "c"]);
}
