//! Shared fixtures for gateway integration tests.
//!
//! Requests go through the full application into a loopback upstream that
//! echoes what it received as JSON. The same upstream serves a mutable key
//! set at `/keys` and an upgradable log tail that echoes bytes.

#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode, Uri, header},
    response::Response,
    routing::get,
};
use axum_test::TestServer;
use gatekeep_labels::StaticLabelStore;
use gatekeep_proxy::{
    AppState, GatewayMetrics, IdentityResolver, JwksCache, ServerConfig, TlsOptions, Upstream,
    Upstreams, create_app, create_internal_app,
};
use gatekeep_query::Dialect;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const SECRET: &[u8] = b"gatekeep-test-signing-secret-0000";
pub const ROTATED_SECRET: &[u8] = b"other-signing-secret-for-rotation";

pub const KEYS: &str = r#"{"keys":[
    {"kty":"oct","kid":"test-key","alg":"HS256","k":"Z2F0ZWtlZXAtdGVzdC1zaWduaW5nLXNlY3JldC0wMDAw"}
]}"#;

pub const ROTATED_KEYS: &str = r#"{"keys":[
    {"kty":"oct","kid":"test-key","alg":"HS256","k":"Z2F0ZWtlZXAtdGVzdC1zaWduaW5nLXNlY3JldC0wMDAw"},
    {"kty":"oct","kid":"rotated","alg":"HS256","k":"b3RoZXItc2lnbmluZy1zZWNyZXQtZm9yLXJvdGF0aW9u"}
]}"#;

pub const LABELS: &str = r#"
users:
  alice: [namespace1]
  bob: [namespace1, namespace2]
groups:
  platform: ["#cluster-wide"]
  gatekeep-admins: [admin-ns]
"#;

// ============================================================================
// Echo upstream
// ============================================================================

/// Loopback server echoing requests.
#[derive(Clone)]
pub struct EchoUpstream {
    pub url: String,
    keys: Arc<Mutex<String>>,
}

impl EchoUpstream {
    pub async fn spawn() -> Self {
        let keys = Arc::new(Mutex::new(KEYS.to_string()));
        let app = Router::new()
            .route("/keys", get(serve_keys))
            .route("/loki/api/v1/tail", get(tail))
            .fallback(echo)
            .with_state(Arc::clone(&keys));

        let addr = listen(app).await;

        Self {
            url: format!("http://{}", addr),
            keys,
        }
    }

    /// Replaces the served key set.
    pub fn set_keys(&self, document: &str) {
        *self.keys.lock() = document.to_string();
    }

    pub fn keys_url(&self) -> url::Url {
        url::Url::parse(&format!("{}/keys", self.url)).unwrap()
    }
}

async fn serve_keys(State(keys): State<Arc<Mutex<String>>>) -> String {
    keys.lock().clone()
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let headers: Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect();

    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query().unwrap_or_default(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    }))
}

/// Switches to a raw protocol that first writes the query string received,
/// then echoes every byte back.
async fn tail(mut request: Request) -> Response {
    let query = request.uri().query().unwrap_or_default().to_string();
    let on_upgrade = hyper::upgrade::on(&mut request);
    tokio::spawn(async move {
        let Ok(upgraded) = on_upgrade.await else {
            return;
        };
        let mut io = hyper_util::rt::TokioIo::new(upgraded);
        if io.write_all(format!("{}\n", query).as_bytes()).await.is_err() {
            return;
        }
        let mut buf = [0u8; 256];
        loop {
            match io.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if io.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "echo")
        .body(Body::empty())
        .unwrap()
}

/// Serves `app` on a loopback port.
pub async fn listen(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Values of `name` in a form-encoded string.
pub fn params(encoded: &str, name: &str) -> Vec<String> {
    url::form_urlencoded::parse(encoded.as_bytes())
        .filter(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .collect()
}

// ============================================================================
// Tokens
// ============================================================================

pub fn sign(kid: &str, secret: &[u8], claims: Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(kid.to_string());
    jsonwebtoken::encode(&header, &claims, &EncodingKey::from_secret(secret)).unwrap()
}

pub fn token(username: &str, groups: &[&str]) -> String {
    sign(
        "test-key",
        SECRET,
        json!({
            "preferred_username": username,
            "email": format!("{}@example.com", username),
            "groups": groups,
            "exp": chrono::Utc::now().timestamp() + 300,
        }),
    )
}

pub fn bearer(token: &str) -> axum::http::HeaderValue {
    axum::http::HeaderValue::from_str(&format!("Bearer {}", token)).unwrap()
}

// ============================================================================
// Gateway
// ============================================================================

/// A gateway wired to an echo upstream.
pub struct Gateway {
    pub state: AppState,
    pub server: TestServer,
    pub internal: TestServer,
    pub upstream: EchoUpstream,
    pub labels: Arc<StaticLabelStore>,
    pub labels_file: NamedTempFile,
}

pub async fn gateway() -> Gateway {
    gateway_with(|_| {}).await
}

pub async fn gateway_with(customize: impl FnOnce(&mut ServerConfig)) -> Gateway {
    let upstream = EchoUpstream::spawn().await;
    let keys = Arc::new(JwksCache::from_static(KEYS).unwrap());
    build(upstream, keys, customize)
}

pub fn build(
    upstream: EchoUpstream,
    keys: Arc<JwksCache>,
    customize: impl FnOnce(&mut ServerConfig),
) -> Gateway {
    let labels_file = NamedTempFile::new().unwrap();
    fs::write(labels_file.path(), LABELS).unwrap();

    let mut config = ServerConfig {
        dev_mode: false,
        thanos_url: upstream.url.clone(),
        loki_url: upstream.url.clone(),
        labels_file: labels_file.path().display().to_string(),
        ..ServerConfig::for_testing()
    };
    customize(&mut config);

    let labels = Arc::new(StaticLabelStore::load(labels_file.path()).unwrap());
    let identity = IdentityResolver::new(keys, config.group_claim.clone());

    let tls = TlsOptions::default();
    let token = config.service_account_token.clone();
    let upstreams = Upstreams {
        metrics: Upstream::from_settings(&config.upstream(Dialect::Promql), &tls, token.as_deref())
            .unwrap(),
        logs: Upstream::from_settings(&config.upstream(Dialect::Logql), &tls, token.as_deref())
            .unwrap(),
    };

    let metrics = GatewayMetrics::new().unwrap();
    let state = AppState::new(config, identity, labels.clone(), upstreams, metrics);
    let server = TestServer::new(create_app(state.clone())).expect("Failed to create test server");
    let internal = TestServer::new(create_internal_app(state.clone()))
        .expect("Failed to create internal server");

    Gateway {
        state,
        server,
        internal,
        upstream,
        labels,
        labels_file,
    }
}
