//! Forwarding to the metrics and log backends.
//!
//! The caller's credential never reaches an upstream. When mutual auth is on
//! for a target the gateway's own service token is sent instead.
//!
//! A GET asking to switch protocols (the log tail WebSocket) is forwarded with
//! its `Connection`/`Upgrade` pair restored. If the upstream answers `101`,
//! both upgraded connections are joined and bytes are copied until either
//! side closes.

use std::fs;
use std::path::Path;

use axum::body::Body;
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use gatekeep_labels::Identity;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use http::{Method, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{UpstreamSettings, parse_header_pair};
use crate::error::GatewayError;

/// Headers scoped to a single connection.
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Errors building an upstream.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The base URL is not valid.
    #[error("invalid upstream URL '{url}': {message}")]
    Url {
        /// URL as configured.
        url: String,
        /// Parse failure.
        message: String,
    },

    /// An extra header or the actor header is not a valid HTTP header.
    #[error("invalid header '{0}'")]
    Header(String),

    /// A certificate, key or CA file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP client could not be configured.
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Where and how a dialect's requests are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    /// Base URL; request paths are appended to its path.
    pub base_url: Url,
    /// Label partitioning data by tenant.
    pub tenant_label: String,
    /// Send the service token in place of the caller's credential.
    pub use_mutual_auth: bool,
}

/// TLS settings shared by all outbound clients.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM root certificates added to the system roots.
    pub root_certificates: Vec<Vec<u8>>,
    /// Accept any server certificate.
    pub verify_skip: bool,
}

impl TlsOptions {
    /// Loads extra root certificates from a PEM file or every file in a
    /// directory.
    pub fn load(trusted_root_ca: Option<&str>, verify_skip: bool) -> Result<Self, DispatchError> {
        let mut root_certificates = Vec::new();
        if let Some(path) = trusted_root_ca {
            let path = Path::new(path);
            if path.is_dir() {
                let entries = fs::read_dir(path).map_err(|source| read_error(path, source))?;
                for entry in entries {
                    let file = entry.map_err(|source| read_error(path, source))?.path();
                    // Skip the `..data` style links of mounted secrets.
                    let hidden = file
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with('.'));
                    if file.is_file() && !hidden {
                        debug!(path = %file.display(), "adding trusted CA");
                        root_certificates.push(read_file(&file)?);
                    }
                }
            } else {
                root_certificates.push(read_file(path)?);
            }
        }
        Ok(Self {
            root_certificates,
            verify_skip,
        })
    }

    /// Starts a client builder with these settings applied.
    pub fn client_builder(&self) -> Result<reqwest::ClientBuilder, DispatchError> {
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(self.verify_skip);
        for pem in &self.root_certificates {
            for certificate in reqwest::Certificate::from_pem_bundle(pem)? {
                builder = builder.add_root_certificate(certificate);
            }
        }
        Ok(builder)
    }
}

fn read_error(path: &Path, source: std::io::Error) -> DispatchError {
    DispatchError::Read {
        path: path.display().to_string(),
        source,
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, DispatchError> {
    fs::read(path).map_err(|source| read_error(path, source))
}

/// The caller's side of a protocol switch.
#[derive(Debug)]
pub struct ClientUpgrade {
    protocol: HeaderValue,
    on_upgrade: OnUpgrade,
}

impl ClientUpgrade {
    /// Takes the pending upgrade from a GET carrying `Connection: upgrade`.
    pub fn take(parts: &mut Parts) -> Option<Self> {
        if parts.method != Method::GET || !wants_upgrade(&parts.headers) {
            return None;
        }
        let protocol = parts.headers.get(header::UPGRADE)?.clone();
        let on_upgrade = parts.extensions.remove::<OnUpgrade>()?;
        Some(Self {
            protocol,
            on_upgrade,
        })
    }
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// A request ready to be sent upstream.
#[derive(Debug)]
pub struct Outbound {
    /// Request method.
    pub method: Method,
    /// Path as received.
    pub path: String,
    /// Query string after enforcement.
    pub query: Option<String>,
    /// Inbound headers.
    pub headers: HeaderMap,
    /// Body after enforcement.
    pub body: Bytes,
    /// Pending protocol switch requested by the caller.
    pub upgrade: Option<ClientUpgrade>,
}

/// One configured backend.
#[derive(Debug, Clone)]
pub struct Upstream {
    target: UpstreamTarget,
    client: reqwest::Client,
    extra_headers: HeaderMap,
    actor_header: Option<HeaderName>,
    service_token: Option<HeaderValue>,
}

impl Upstream {
    /// Creates an upstream sending through `client`.
    pub fn new(target: UpstreamTarget, client: reqwest::Client) -> Self {
        Self {
            target,
            client,
            extra_headers: HeaderMap::new(),
            actor_header: None,
            service_token: None,
        }
    }

    /// Builds an upstream from its configured settings.
    ///
    /// `service_token` is only attached when the target uses mutual auth.
    pub fn from_settings(
        settings: &UpstreamSettings<'_>,
        tls: &TlsOptions,
        service_token: Option<&str>,
    ) -> Result<Self, DispatchError> {
        let base_url = Url::parse(settings.url).map_err(|e| DispatchError::Url {
            url: settings.url.to_string(),
            message: e.to_string(),
        })?;

        let mut builder = tls.client_builder()?;
        if let (Some(cert), Some(key)) = (settings.cert, settings.key) {
            let mut pem = read_file(Path::new(cert))?;
            pem.push(b'\n');
            pem.extend(read_file(Path::new(key))?);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
            info!(cert, "using client certificate");
        }

        let target = UpstreamTarget {
            base_url,
            tenant_label: settings.tenant_label.to_string(),
            use_mutual_auth: settings.mutual_auth,
        };
        let mut upstream = Self::new(target, builder.build()?);

        for raw in settings.headers {
            let (name, value) =
                parse_header_pair(raw).ok_or_else(|| DispatchError::Header(raw.clone()))?;
            upstream = upstream.with_header(name, value)?;
        }
        if let Some(name) = settings.actor_header {
            upstream = upstream.with_actor_header(name)?;
        }
        if settings.mutual_auth {
            if let Some(token) = service_token {
                upstream = upstream.with_service_token(token)?;
            }
        }
        Ok(upstream)
    }

    /// Adds a static header to every forwarded request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, DispatchError> {
        let name = HeaderName::try_from(name).map_err(|_| DispatchError::Header(name.to_string()))?;
        let value =
            HeaderValue::try_from(value).map_err(|_| DispatchError::Header(name.to_string()))?;
        self.extra_headers.insert(name, value);
        Ok(self)
    }

    /// Sends the caller identity as `base64(username + email)` in `name`.
    pub fn with_actor_header(mut self, name: &str) -> Result<Self, DispatchError> {
        let name = HeaderName::try_from(name).map_err(|_| DispatchError::Header(name.to_string()))?;
        self.actor_header = Some(name);
        Ok(self)
    }

    /// Sets the token sent when the target uses mutual auth.
    pub fn with_service_token(mut self, token: &str) -> Result<Self, DispatchError> {
        let mut value = HeaderValue::try_from(format!("Bearer {}", token.trim()))
            .map_err(|_| DispatchError::Header("service token".to_string()))?;
        value.set_sensitive(true);
        self.service_token = Some(value);
        Ok(self)
    }

    /// The target this upstream sends to.
    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Joins `path` and `query` onto the base URL.
    pub fn url_for(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.target.base_url.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{}{}", base, path));
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }

    /// Headers sent upstream for a request with `inbound` headers.
    pub fn outbound_headers(&self, inbound: &HeaderMap, identity: &Identity) -> HeaderMap {
        let mut headers = strip_hop_by_hop(inbound);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::AUTHORIZATION);

        for (name, value) in &self.extra_headers {
            headers.insert(name.clone(), value.clone());
        }

        if let Some(name) = &self.actor_header {
            let actor = STANDARD.encode(format!("{}{}", identity.username, identity.email));
            if let Ok(value) = HeaderValue::try_from(actor) {
                headers.insert(name.clone(), value);
            }
        }

        if self.target.use_mutual_auth {
            if let Some(token) = &self.service_token {
                headers.insert(header::AUTHORIZATION, token.clone());
            }
        }
        headers
    }

    /// Sends `request` and streams the upstream response back unchanged.
    pub async fn forward(
        &self,
        request: Outbound,
        identity: &Identity,
    ) -> Result<Response, GatewayError> {
        let url = self.url_for(&request.path, request.query.as_deref());
        let mut headers = self.outbound_headers(&request.headers, identity);
        if let Some(upgrade) = &request.upgrade {
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(header::UPGRADE, upgrade.protocol.clone());
        }
        debug!(
            method = %request.method,
            url = %url,
            upgrade = request.upgrade.is_some(),
            "forwarding request"
        );

        let upstream = self
            .client
            .request(request.method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(GatewayError::Upstream)?;

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers());
        if let Some(client) = request.upgrade {
            if status == StatusCode::SWITCHING_PROTOCOLS {
                return tunnel(client, upstream, headers).await;
            }
        }

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Completes a protocol switch and copies bytes between caller and upstream.
async fn tunnel(
    client: ClientUpgrade,
    upstream: reqwest::Response,
    mut headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let protocol = upstream
        .headers()
        .get(header::UPGRADE)
        .cloned()
        .unwrap_or_else(|| client.protocol.clone());
    let backend = upstream.upgrade().await.map_err(GatewayError::Upstream)?;

    tokio::spawn(async move {
        let caller = match client.on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(error = %e, "caller upgrade failed");
                return;
            }
        };
        let mut caller = TokioIo::new(caller);
        let mut backend = backend;
        match tokio::io::copy_bidirectional(&mut caller, &mut backend).await {
            Ok((sent, received)) => debug!(sent, received, "upgraded connection closed"),
            Err(e) => debug!(error = %e, "upgraded connection ended"),
        }
    });

    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, protocol);
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Copies `headers` without hop-by-hop headers or those named in `Connection`.
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();

    let mut out = headers.clone();
    for name in HOP_BY_HOP.iter().chain(&listed) {
        out.remove(name);
    }
    out
}
