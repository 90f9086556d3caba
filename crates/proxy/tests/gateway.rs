//! End-to-end gateway tests.
//!
//! Tests run through the full application:
//! - Authentication failures and their 403 bodies
//! - Query enforcement in URLs and form bodies
//! - Cluster-wide and admin bypass
//! - Upstream header policy (credential stripping, service token, actor)
//! - Key rotation and health probes
//! - Protocol upgrades on the log tail route
//! - Request metrics

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use gatekeep_proxy::JwksCache;
use serde_json::{Value, json};

use common::*;

const AUTHORIZATION: HeaderName = HeaderName::from_static("authorization");

// ============================================================================
// Authentication
// ============================================================================

mod authentication {
    use super::*;

    #[tokio::test]
    async fn test_missing_header_is_forbidden() {
        let gw = gateway().await;

        let response = gw.server.get("/api/v1/query").add_query_param("query", "up").await;

        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(response.text(), "authentication failed\n");
    }

    #[tokio::test]
    async fn test_garbage_token_is_forbidden() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, HeaderValue::from_static("Bearer not.a.jwt"))
            .await;

        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(response.text(), "authentication failed\n");
    }

    #[tokio::test]
    async fn test_expired_token_is_forbidden() {
        let gw = gateway().await;
        let expired = sign(
            "test-key",
            SECRET,
            json!({"preferred_username": "alice", "exp": chrono::Utc::now().timestamp() - 600}),
        );

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&expired))
            .await;

        response.assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_wrong_key_is_forbidden() {
        let gw = gateway().await;
        let forged = sign(
            "test-key",
            ROTATED_SECRET,
            json!({"preferred_username": "alice"}),
        );

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&forged))
            .await;

        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(response.text(), "authentication failed\n");
    }

    #[tokio::test]
    async fn test_rotated_key_is_fetched_on_demand() {
        let upstream = EchoUpstream::spawn().await;
        let keys = JwksCache::remote(
            upstream.keys_url(),
            reqwest::Client::new(),
            Duration::from_secs(2),
            Duration::ZERO,
            None,
        )
        .unwrap();
        keys.refresh().await.unwrap();
        let gw = build(upstream, Arc::new(keys), |_| {});

        let rotated = sign(
            "rotated",
            ROTATED_SECRET,
            json!({"preferred_username": "alice"}),
        );

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&rotated))
            .await;
        response.assert_status(StatusCode::FORBIDDEN);

        gw.upstream.set_keys(ROTATED_KEYS);

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&rotated))
            .await;
        response.assert_status_ok();
    }
}

// ============================================================================
// Enforcement
// ============================================================================

mod enforcement {
    use super::*;

    #[tokio::test]
    async fn test_get_query_is_scoped() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_query_param("time", "1700000000")
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(echoed["method"], "GET");
        assert_eq!(echoed["path"], "/api/v1/query");
        let query = echoed["query"].as_str().unwrap();
        assert_eq!(params(query, "query"), vec![r#"up{namespace="namespace1"}"#]);
        assert_eq!(params(query, "time"), vec!["1700000000"]);
    }

    #[tokio::test]
    async fn test_multiple_tenants_use_regex() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/api/v1/query_range")
            .add_query_param("query", "rate(http_requests_total[5m])")
            .add_header(AUTHORIZATION, bearer(&token("bob", &[])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(
            params(echoed["query"].as_str().unwrap(), "query"),
            vec![r#"rate(http_requests_total{namespace=~"namespace1|namespace2"}[5m])"#]
        );
    }

    #[tokio::test]
    async fn test_missing_match_gets_default_selector() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/api/v1/label/job/values")
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(echoed["path"], "/api/v1/label/job/values");
        assert_eq!(
            params(echoed["query"].as_str().unwrap(), "match[]"),
            vec![r#"{__name__=~".+", namespace="namespace1"}"#]
        );
    }

    #[tokio::test]
    async fn test_unauthorized_namespace_is_forbidden() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", r#"up{namespace="namespace2"}"#)
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(response.text(), "unauthorized namespace namespace2\n");
    }

    #[tokio::test]
    async fn test_user_without_tenants_is_forbidden() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&token("carol", &[])))
            .await;

        response.assert_status(StatusCode::FORBIDDEN);
        assert_eq!(response.text(), "no tenant labels found\n");
    }

    #[tokio::test]
    async fn test_invalid_query_is_forbidden() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "sum(")
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_post_form_is_rewritten() {
        let gw = gateway().await;

        let response = gw
            .server
            .post("/loki/api/v1/query_range")
            .form(&[("query", r#"{app="web"} |= "error""#), ("limit", "100")])
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(echoed["method"], "POST");
        let body = echoed["body"].as_str().unwrap();
        assert_eq!(
            params(body, "query"),
            vec![r#"{app="web", kubernetes_namespace_name="namespace1"} |= "error""#]
        );
        assert_eq!(params(body, "limit"), vec!["100"]);
        assert_eq!(
            echoed["headers"]["content-length"],
            body.len().to_string()
        );
        assert!(params(echoed["query"].as_str().unwrap(), "query").is_empty());
    }

    #[tokio::test]
    async fn test_post_json_body_is_forbidden() {
        let gw = gateway().await;

        let response = gw
            .server
            .post("/api/v1/query")
            .json(&json!({"query": "up"}))
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_loki_series_match_is_scoped() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/loki/api/v1/series")
            .add_query_param("match[]", r#"{app="web"}"#)
            .add_header(AUTHORIZATION, bearer(&token("bob", &[])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(
            params(echoed["query"].as_str().unwrap(), "match[]"),
            vec![r#"{app="web", kubernetes_namespace_name=~"namespace1|namespace2"}"#]
        );
    }
}

// ============================================================================
// Bypass
// ============================================================================

mod bypass {
    use super::*;

    #[tokio::test]
    async fn test_cluster_wide_group_is_not_rewritten() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", r#"up{namespace="anything"}"#)
            .add_header(AUTHORIZATION, bearer(&token("dana", &["Platform"])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(
            params(echoed["query"].as_str().unwrap(), "query"),
            vec![r#"up{namespace="anything"}"#]
        );
    }

    #[tokio::test]
    async fn test_admin_bypass_skips_enforcement() {
        let gw = gateway_with(|config| config.admin_bypass = true).await;

        let response = gw
            .server
            .get("/api/v1/labels")
            .add_header(AUTHORIZATION, bearer(&token("erin", &["gatekeep-admins"])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(echoed["query"], "");
    }

    #[tokio::test]
    async fn test_admin_group_is_scoped_without_bypass() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&token("erin", &["gatekeep-admins"])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(
            params(echoed["query"].as_str().unwrap(), "query"),
            vec![r#"up{namespace="admin-ns"}"#]
        );
    }
}

// ============================================================================
// Upstream headers
// ============================================================================

mod upstream_headers {
    use super::*;

    #[tokio::test]
    async fn test_caller_credential_is_stripped() {
        let gw = gateway().await;

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert!(echoed["headers"].get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_mutual_auth_sends_service_token() {
        let gw = gateway_with(|config| config.thanos_mutual_auth = true).await;

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(echoed["headers"]["authorization"], "Bearer service-token");

        // Loki does not use mutual auth in this setup.
        let response = gw
            .server
            .get("/loki/api/v1/labels")
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;
        let echoed: Value = response.json();
        assert!(echoed["headers"].get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_actor_and_static_headers() {
        let gw = gateway_with(|config| {
            config.loki_actor_header = Some("X-Actor".to_string());
            config.loki_headers = vec!["X-Scope-OrgID=fake".to_string()];
        })
        .await;

        let response = gw
            .server
            .get("/loki/api/v1/query")
            .add_query_param("query", r#"{app="web"}"#)
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(
            echoed["headers"]["x-actor"],
            "YWxpY2VhbGljZUBleGFtcGxlLmNvbQ=="
        );
        assert_eq!(echoed["headers"]["x-scope-orgid"], "fake");
    }

    #[tokio::test]
    async fn test_base_path_is_kept() {
        let upstream = EchoUpstream::spawn().await;
        let keys = Arc::new(JwksCache::from_static(KEYS).unwrap());
        let base = format!("{}/thanos", upstream.url);
        let gw = build(upstream, keys, |config| config.thanos_url = base);

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status_ok();
        let echoed: Value = response.json();
        assert_eq!(echoed["path"], "/thanos/api/v1/query");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let gw = gateway_with(|config| config.thanos_url = "http://127.0.0.1:9".to_string()).await;

        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;

        response.assert_status(StatusCode::BAD_GATEWAY);
    }
}

// ============================================================================
// Health
// ============================================================================

mod health {
    use super::*;

    #[tokio::test]
    async fn test_healthz_ok() {
        let gw = gateway().await;

        let response = gw.internal.get("/healthz").await;
        response.assert_status_ok();
        assert_eq!(response.text(), "Ok");

        let response = gw.internal.get("/health").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["label_store"], "static");
        assert!(body["timestamp"].is_string());

        gw.internal.get("/ready").await.assert_status_ok();
    }

    #[tokio::test]
    async fn test_failed_label_reload_is_unhealthy() {
        let gw = gateway().await;
        fs::write(gw.labels_file.path(), "users: [").unwrap();
        assert!(gw.labels.reload().is_err());

        let response = gw.internal.get("/healthz").await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.text(), "Unhealthy");

        gw.internal
            .get("/ready")
            .await
            .assert_status(StatusCode::SERVICE_UNAVAILABLE);

        // The last good mapping keeps serving.
        let response = gw
            .server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn test_probes_are_not_on_proxy_listener() {
        let gw = gateway().await;
        gw.server
            .get("/healthz")
            .expect_failure()
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}

// ============================================================================
// Upgrade
// ============================================================================

mod upgrade {
    use super::*;
    use gatekeep_proxy::create_app;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;

    async fn read_head(reader: &mut BufReader<TcpStream>) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            if line == "\r\n" || line.is_empty() {
                return lines;
            }
            lines.push(line.trim_end().to_string());
        }
    }

    #[tokio::test]
    async fn test_tail_upgrade_is_scoped_and_tunneled() {
        let gw = gateway().await;
        let addr = listen(create_app(gw.state.clone())).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut reader = BufReader::new(stream);
        let request = format!(
            "GET /loki/api/v1/tail?query=%7Bapp%3D%22nginx%22%7D HTTP/1.1\r\n\
             Host: gateway\r\n\
             Authorization: Bearer {}\r\n\
             Connection: Upgrade\r\n\
             Upgrade: echo\r\n\r\n",
            token("alice", &[])
        );
        reader.get_mut().write_all(request.as_bytes()).await.unwrap();

        let head = read_head(&mut reader).await;
        assert!(head[0].contains(" 101 "), "{:?}", head);
        assert!(
            head.iter()
                .any(|line| line.eq_ignore_ascii_case("upgrade: echo"))
        );

        // The upstream writes back the query it received.
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(
            params(line.trim_end(), "query"),
            vec![r#"{app="nginx", kubernetes_namespace_name="namespace1"}"#]
        );

        reader.get_mut().write_all(b"ping\n").await.unwrap();
        let mut echoed = String::new();
        reader.read_line(&mut echoed).await.unwrap();
        assert_eq!(echoed, "ping\n");
    }

    #[tokio::test]
    async fn test_tail_upgrade_without_token_is_forbidden() {
        let gw = gateway().await;
        let addr = listen(create_app(gw.state.clone())).await;

        let mut reader = BufReader::new(TcpStream::connect(addr).await.unwrap());
        reader
            .get_mut()
            .write_all(
                b"GET /loki/api/v1/tail?query=%7Bapp%3D%22nginx%22%7D HTTP/1.1\r\n\
                  Host: gateway\r\n\
                  Connection: Upgrade\r\n\
                  Upgrade: echo\r\n\r\n",
            )
            .await
            .unwrap();

        let head = read_head(&mut reader).await;
        assert!(head[0].contains(" 403 "), "{:?}", head);
    }
}

// ============================================================================
// Metrics
// ============================================================================

mod metrics {
    use super::*;

    #[tokio::test]
    async fn test_requests_are_counted_by_route_and_status() {
        let gw = gateway().await;

        gw.server
            .get("/api/v1/query")
            .add_query_param("query", "up")
            .add_header(AUTHORIZATION, bearer(&token("alice", &[])))
            .await
            .assert_status_ok();
        gw.server
            .get("/loki/api/v1/query")
            .add_query_param("query", r#"{app="nginx"}"#)
            .expect_failure()
            .await
            .assert_status(StatusCode::FORBIDDEN);

        let response = gw.internal.get("/metrics").await;
        response.assert_status_ok();
        let content_type = response.header("content-type");
        assert!(content_type.to_str().unwrap().starts_with("text/plain"));

        let text = response.text();
        assert!(text.contains(
            r#"gatekeep_http_requests_total{method="GET",route="/api/v1/query",status="200"} 1"#
        ));
        assert!(text.contains(
            r#"gatekeep_http_requests_total{method="GET",route="/loki/api/v1/query",status="403"} 1"#
        ));
        assert!(text.contains(
            r#"gatekeep_http_request_duration_seconds_count{method="GET",route="/api/v1/query",status="200"} 1"#
        ));
    }

    #[tokio::test]
    async fn test_metrics_are_not_on_proxy_listener() {
        let gw = gateway().await;
        gw.server
            .get("/metrics")
            .expect_failure()
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
