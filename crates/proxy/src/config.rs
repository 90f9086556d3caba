//! Gateway configuration.
//!
//! Every option can be given as a command line flag or through the matching
//! environment variable. The tenant mapping itself lives in the separate
//! labels file (see `gatekeep_labels::StaticLabelStore`).
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `GATEKEEP_PORT` | 8080 | Proxy port |
//! | `GATEKEEP_INTERNAL_PORT` | 8081 | Health port |
//! | `GATEKEEP_HOST` | 127.0.0.1 | Host to bind |
//! | `GATEKEEP_LOG_LEVEL` | info | Log level |
//! | `GATEKEEP_LOG_TOKENS` | false | Log credential headers unredacted |
//! | `GATEKEEP_MAX_BODY_SIZE` | 10485760 | Max POST body (bytes) |
//! | `GATEKEEP_REQUEST_TIMEOUT` | 60 | Request timeout (seconds) |
//! | `GATEKEEP_JWKS_URL` | - | Key set endpoint |
//! | `GATEKEEP_JWKS_STATIC` | - | Inline JWK set merged into the fetched keys |
//! | `GATEKEEP_JWKS_REFRESH_INTERVAL` | 3600 | Periodic key refresh (seconds) |
//! | `GATEKEEP_JWKS_MIN_REFRESH_INTERVAL` | 300 | Minimum spacing of unknown-key refreshes (seconds) |
//! | `GATEKEEP_JWKS_TIMEOUT` | 10 | Key fetch timeout (seconds) |
//! | `GATEKEEP_GROUP_CLAIM` | groups | Claim holding the caller's groups |
//! | `GATEKEEP_DEV_MODE` | false | Skip token signature verification |
//! | `GATEKEEP_ADMIN_BYPASS` | false | Let the admin group skip enforcement |
//! | `GATEKEEP_ADMIN_GROUP` | gatekeep-admins | Admin group name |
//! | `GATEKEEP_LABEL_STORE` | static | `static` or `sqlite` |
//! | `GATEKEEP_LABELS_FILE` | /etc/gatekeep/labels.yaml | Static label file |
//! | `GATEKEEP_LABELS_RELOAD_INTERVAL` | 10 | Label file poll interval (seconds) |
//! | `GATEKEEP_SQLITE_PATH` | - | SQLite database |
//! | `GATEKEEP_SQLITE_QUERY` | - | Tenant query, `?` bound to the identity key |
//! | `GATEKEEP_SQLITE_IDENTITY_KEY` | email | `email`, `preferredUsername` or `groups` |
//! | `GATEKEEP_SQLITE_MAX_CONNECTIONS` | 4 | Pool size |
//! | `GATEKEEP_SERVICE_ACCOUNT_TOKEN` | - | Upstream service token |
//! | `GATEKEEP_SERVICE_ACCOUNT_TOKEN_PATH` | /var/run/secrets/kubernetes.io/serviceaccount/token | Token file |
//! | `GATEKEEP_THANOS_URL` | http://localhost:9090 | Metrics upstream |
//! | `GATEKEEP_THANOS_TENANT_LABEL` | namespace | Metrics tenant label |
//! | `GATEKEEP_THANOS_MUTUAL_AUTH` | false | Send the service token to the metrics upstream |
//! | `GATEKEEP_LOKI_URL` | http://localhost:3100 | Log upstream |
//! | `GATEKEEP_LOKI_TENANT_LABEL` | kubernetes_namespace_name | Log tenant label |
//! | `GATEKEEP_LOKI_MUTUAL_AUTH` | false | Send the service token to the log upstream |
//! | `GATEKEEP_TRUSTED_ROOT_CA` | - | Extra PEM root certificates (file or directory) |
//! | `GATEKEEP_TLS_VERIFY_SKIP` | false | Skip upstream certificate verification |
//!
//! | `GATEKEEP_THANOS_HEADERS` | - | Extra `NAME=VALUE` headers for the metrics upstream, one per line |
//! | `GATEKEEP_LOKI_HEADERS` | - | Extra `NAME=VALUE` headers for the log upstream, one per line |
//!
//! Header values may contain commas, so header lists are split on newlines
//! only. On the command line, repeat the flag once per header.
//!
//! The actor header and client certificates follow the same per-upstream
//! pattern (`GATEKEEP_LOKI_ACTOR_HEADER`, `GATEKEEP_THANOS_CERT`, ...).
//!
//! # Example
//!
//! ```rust
//! use gatekeep_proxy::ServerConfig;
//!
//! let config = ServerConfig {
//!     port: 3000,
//!     jwks_url: Some("https://sso.example.com/certs".to_string()),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use clap::Parser;
use gatekeep_labels::ProviderKind;
use gatekeep_query::Dialect;
use url::Url;

/// Gateway configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "gatekeep")]
#[command(about = "Tenant-enforcing gateway for PromQL and LogQL backends")]
pub struct ServerConfig {
    /// Port the proxy listens on.
    #[arg(short, long, env = "GATEKEEP_PORT", default_value = "8080")]
    pub port: u16,

    /// Port for the health endpoints.
    #[arg(long, env = "GATEKEEP_INTERNAL_PORT", default_value = "8081")]
    pub internal_port: u16,

    /// Host address to bind to.
    #[arg(long, env = "GATEKEEP_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, env = "GATEKEEP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log credential headers without redaction.
    #[arg(long, env = "GATEKEEP_LOG_TOKENS", default_value = "false")]
    pub log_tokens: bool,

    /// Maximum POST body size in bytes.
    #[arg(long, env = "GATEKEEP_MAX_BODY_SIZE", default_value = "10485760")]
    pub max_body_size: usize,

    /// Request timeout in seconds.
    #[arg(long, env = "GATEKEEP_REQUEST_TIMEOUT", default_value = "60")]
    pub request_timeout: u64,

    /// URL of the JSON Web Key Set used to verify tokens.
    #[arg(long, env = "GATEKEEP_JWKS_URL")]
    pub jwks_url: Option<String>,

    /// Inline JSON Web Key Set, merged with the fetched keys.
    #[arg(long, env = "GATEKEEP_JWKS_STATIC")]
    pub jwks_static: Option<String>,

    /// Seconds between periodic key set refreshes.
    #[arg(long, env = "GATEKEEP_JWKS_REFRESH_INTERVAL", default_value = "3600")]
    pub jwks_refresh_interval: u64,

    /// Minimum seconds between refreshes triggered by unknown key IDs.
    #[arg(long, env = "GATEKEEP_JWKS_MIN_REFRESH_INTERVAL", default_value = "300")]
    pub jwks_min_refresh_interval: u64,

    /// Key set fetch timeout in seconds.
    #[arg(long, env = "GATEKEEP_JWKS_TIMEOUT", default_value = "10")]
    pub jwks_timeout: u64,

    /// Token claim holding the caller's groups.
    #[arg(long, env = "GATEKEEP_GROUP_CLAIM", default_value = "groups")]
    pub group_claim: String,

    /// Skip token signature verification. Never enable in production.
    #[arg(long, env = "GATEKEEP_DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Let members of the admin group bypass enforcement.
    #[arg(long, env = "GATEKEEP_ADMIN_BYPASS", default_value = "false")]
    pub admin_bypass: bool,

    /// Name of the admin group.
    #[arg(long, env = "GATEKEEP_ADMIN_GROUP", default_value = "gatekeep-admins")]
    pub admin_group: String,

    /// Tenant label source (static, sqlite).
    #[arg(long, env = "GATEKEEP_LABEL_STORE", default_value = "static")]
    pub label_store: String,

    /// YAML file mapping users and groups to tenants.
    #[arg(
        long,
        env = "GATEKEEP_LABELS_FILE",
        default_value = "/etc/gatekeep/labels.yaml"
    )]
    pub labels_file: String,

    /// Seconds between label file change checks.
    #[arg(long, env = "GATEKEEP_LABELS_RELOAD_INTERVAL", default_value = "10")]
    pub labels_reload_interval: u64,

    /// SQLite database holding tenant assignments.
    #[arg(long, env = "GATEKEEP_SQLITE_PATH")]
    pub sqlite_path: Option<String>,

    /// Query returning one tenant per row; every `?` is bound to the identity key.
    #[arg(long, env = "GATEKEEP_SQLITE_QUERY")]
    pub sqlite_query: Option<String>,

    /// Identity property bound to the query (email, preferredUsername, groups).
    #[arg(long, env = "GATEKEEP_SQLITE_IDENTITY_KEY", default_value = "email")]
    pub sqlite_identity_key: String,

    /// Maximum pooled SQLite connections.
    #[arg(long, env = "GATEKEEP_SQLITE_MAX_CONNECTIONS", default_value = "4")]
    pub sqlite_max_connections: u32,

    /// Service token sent to upstreams with mutual auth enabled.
    #[arg(long, env = "GATEKEEP_SERVICE_ACCOUNT_TOKEN")]
    pub service_account_token: Option<String>,

    /// File holding the service token, read when no token is given directly.
    #[arg(
        long,
        env = "GATEKEEP_SERVICE_ACCOUNT_TOKEN_PATH",
        default_value = "/var/run/secrets/kubernetes.io/serviceaccount/token"
    )]
    pub service_account_token_path: String,

    /// Metrics upstream base URL.
    #[arg(long, env = "GATEKEEP_THANOS_URL", default_value = "http://localhost:9090")]
    pub thanos_url: String,

    /// Tenant label on metrics.
    #[arg(long, env = "GATEKEEP_THANOS_TENANT_LABEL", default_value = "namespace")]
    pub thanos_tenant_label: String,

    /// Send the service token to the metrics upstream.
    #[arg(long, env = "GATEKEEP_THANOS_MUTUAL_AUTH", default_value = "false")]
    pub thanos_mutual_auth: bool,

    /// Extra `NAME=VALUE` headers for the metrics upstream.
    #[arg(long, env = "GATEKEEP_THANOS_HEADERS", value_delimiter = '\n')]
    pub thanos_headers: Vec<String>,

    /// Header carrying the caller identity to the metrics upstream.
    #[arg(long, env = "GATEKEEP_THANOS_ACTOR_HEADER")]
    pub thanos_actor_header: Option<String>,

    /// Client certificate (PEM) for the metrics upstream.
    #[arg(long, env = "GATEKEEP_THANOS_CERT")]
    pub thanos_cert: Option<String>,

    /// Client key (PEM) for the metrics upstream.
    #[arg(long, env = "GATEKEEP_THANOS_KEY")]
    pub thanos_key: Option<String>,

    /// Log upstream base URL.
    #[arg(long, env = "GATEKEEP_LOKI_URL", default_value = "http://localhost:3100")]
    pub loki_url: String,

    /// Tenant label on log streams.
    #[arg(
        long,
        env = "GATEKEEP_LOKI_TENANT_LABEL",
        default_value = "kubernetes_namespace_name"
    )]
    pub loki_tenant_label: String,

    /// Send the service token to the log upstream.
    #[arg(long, env = "GATEKEEP_LOKI_MUTUAL_AUTH", default_value = "false")]
    pub loki_mutual_auth: bool,

    /// Extra `NAME=VALUE` headers for the log upstream.
    #[arg(long, env = "GATEKEEP_LOKI_HEADERS", value_delimiter = '\n')]
    pub loki_headers: Vec<String>,

    /// Header carrying the caller identity to the log upstream.
    #[arg(long, env = "GATEKEEP_LOKI_ACTOR_HEADER")]
    pub loki_actor_header: Option<String>,

    /// Client certificate (PEM) for the log upstream.
    #[arg(long, env = "GATEKEEP_LOKI_CERT")]
    pub loki_cert: Option<String>,

    /// Client key (PEM) for the log upstream.
    #[arg(long, env = "GATEKEEP_LOKI_KEY")]
    pub loki_key: Option<String>,

    /// Additional trusted root certificates: a PEM file or a directory of them.
    #[arg(long, env = "GATEKEEP_TRUSTED_ROOT_CA")]
    pub trusted_root_ca: Option<String>,

    /// Skip upstream TLS certificate verification.
    #[arg(long, env = "GATEKEEP_TLS_VERIFY_SKIP", default_value = "false")]
    pub tls_verify_skip: bool,
}

/// The options of one upstream, borrowed from [`ServerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct UpstreamSettings<'a> {
    /// Base URL.
    pub url: &'a str,
    /// Tenant label name.
    pub tenant_label: &'a str,
    /// Replace the caller's credential with the service token.
    pub mutual_auth: bool,
    /// Extra `NAME=VALUE` headers.
    pub headers: &'a [String],
    /// Header receiving the encoded caller identity.
    pub actor_header: Option<&'a str>,
    /// Client certificate path.
    pub cert: Option<&'a str>,
    /// Client key path.
    pub key: Option<&'a str>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            internal_port: 8081,
            host: "127.0.0.1".to_string(),
            log_level: "info".to_string(),
            log_tokens: false,
            max_body_size: 10 * 1024 * 1024, // 10MB
            request_timeout: 60,
            jwks_url: None,
            jwks_static: None,
            jwks_refresh_interval: 3600,
            jwks_min_refresh_interval: 300,
            jwks_timeout: 10,
            group_claim: "groups".to_string(),
            dev_mode: false,
            admin_bypass: false,
            admin_group: "gatekeep-admins".to_string(),
            label_store: "static".to_string(),
            labels_file: "/etc/gatekeep/labels.yaml".to_string(),
            labels_reload_interval: 10,
            sqlite_path: None,
            sqlite_query: None,
            sqlite_identity_key: "email".to_string(),
            sqlite_max_connections: 4,
            service_account_token: None,
            service_account_token_path: "/var/run/secrets/kubernetes.io/serviceaccount/token"
                .to_string(),
            thanos_url: "http://localhost:9090".to_string(),
            thanos_tenant_label: "namespace".to_string(),
            thanos_mutual_auth: false,
            thanos_headers: Vec::new(),
            thanos_actor_header: None,
            thanos_cert: None,
            thanos_key: None,
            loki_url: "http://localhost:3100".to_string(),
            loki_tenant_label: "kubernetes_namespace_name".to_string(),
            loki_mutual_auth: false,
            loki_headers: Vec::new(),
            loki_actor_header: None,
            loki_cert: None,
            loki_key: None,
            trusted_root_ca: None,
            tls_verify_skip: false,
        }
    }
}

impl ServerConfig {
    /// Returns the proxy socket address to bind to.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the health socket address to bind to.
    pub fn internal_socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.internal_port)
    }

    /// Returns the options of the upstream serving `dialect`.
    pub fn upstream(&self, dialect: Dialect) -> UpstreamSettings<'_> {
        match dialect {
            Dialect::Promql => UpstreamSettings {
                url: &self.thanos_url,
                tenant_label: &self.thanos_tenant_label,
                mutual_auth: self.thanos_mutual_auth,
                headers: &self.thanos_headers,
                actor_header: self.thanos_actor_header.as_deref(),
                cert: self.thanos_cert.as_deref(),
                key: self.thanos_key.as_deref(),
            },
            Dialect::Logql => UpstreamSettings {
                url: &self.loki_url,
                tenant_label: &self.loki_tenant_label,
                mutual_auth: self.loki_mutual_auth,
                headers: &self.loki_headers,
                actor_header: self.loki_actor_header.as_deref(),
                cert: self.loki_cert.as_deref(),
                key: self.loki_key.as_deref(),
            },
        }
    }

    /// Returns true if any upstream needs the service token.
    pub fn needs_service_token(&self) -> bool {
        self.thanos_mutual_auth || self.loki_mutual_auth
    }

    /// Validates the configuration and returns errors if any.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.port == 0 {
            errors.push("Port cannot be 0".to_string());
        }

        if self.port == self.internal_port {
            errors.push("Port and internal port must differ".to_string());
        }

        if self.max_body_size == 0 {
            errors.push("Max body size cannot be 0".to_string());
        }

        if self.request_timeout == 0 {
            errors.push("Request timeout cannot be 0".to_string());
        }

        if self.jwks_refresh_interval == 0 || self.jwks_timeout == 0 {
            errors.push("Key set refresh interval and timeout cannot be 0".to_string());
        }

        if !self.dev_mode && self.jwks_url.is_none() && self.jwks_static.is_none() {
            errors.push("A key set URL or static key set is required outside dev mode".to_string());
        }

        if let Some(url) = &self.jwks_url {
            if let Err(e) = parse_http_url(url) {
                errors.push(format!("Invalid key set URL '{}': {}", url, e));
            }
        }

        if self.admin_bypass && self.admin_group.trim().is_empty() {
            errors.push("Admin bypass requires an admin group".to_string());
        }

        if self.group_claim.is_empty() {
            errors.push("Group claim cannot be empty".to_string());
        }

        self.validate_label_store(&mut errors);

        for dialect in [Dialect::Promql, Dialect::Logql] {
            let upstream = self.upstream(dialect);
            if let Err(e) = parse_http_url(upstream.url) {
                errors.push(format!(
                    "Invalid {} upstream URL '{}': {}",
                    dialect, upstream.url, e
                ));
            }
            if upstream.tenant_label.is_empty() {
                errors.push(format!("{} tenant label cannot be empty", dialect));
            }
            for header in upstream.headers {
                if parse_header_pair(header).is_none() {
                    errors.push(format!(
                        "Invalid {} upstream header '{}', expected NAME=VALUE",
                        dialect, header
                    ));
                }
            }
            if upstream.cert.is_some() != upstream.key.is_some() {
                errors.push(format!(
                    "{} client certificate and key must be given together",
                    dialect
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_label_store(&self, errors: &mut Vec<String>) {
        match self.label_store.parse::<ProviderKind>() {
            Ok(ProviderKind::Static) => {
                if self.labels_reload_interval == 0 {
                    errors.push("Labels reload interval cannot be 0".to_string());
                }
            }
            Ok(ProviderKind::Sqlite) => {
                #[cfg(feature = "sqlite")]
                {
                    if self.sqlite_path.is_none() || self.sqlite_query.is_none() {
                        errors.push("The sqlite label store needs a path and a query".to_string());
                    }
                    if let Err(e) = self
                        .sqlite_identity_key
                        .parse::<gatekeep_labels::IdentityKey>()
                    {
                        errors.push(e.to_string());
                    }
                }
                #[cfg(not(feature = "sqlite"))]
                errors.push("Built without sqlite label store support".to_string());
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    /// Creates a configuration suitable for testing.
    ///
    /// Uses ephemeral ports, dev mode and short timeouts.
    pub fn for_testing() -> Self {
        Self {
            port: 0,
            internal_port: 0,
            log_level: "debug".to_string(),
            request_timeout: 5,
            jwks_timeout: 2,
            jwks_min_refresh_interval: 0,
            dev_mode: true,
            labels_file: "labels.yaml".to_string(),
            service_account_token: Some("service-token".to_string()),
            thanos_url: "http://127.0.0.1:9".to_string(),
            loki_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        }
    }
}

/// Splits a `NAME=VALUE` header option.
pub fn parse_header_pair(raw: &str) -> Option<(&str, &str)> {
    let (name, value) = raw.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

fn parse_http_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ServerConfig {
        ServerConfig {
            jwks_url: Some("https://sso.example.com/certs".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.internal_port, 8081);
        assert!(!config.dev_mode);
        assert!(!config.admin_bypass);
        assert_eq!(config.loki_tenant_label, "kubernetes_namespace_name");
    }

    #[test]
    fn test_socket_addrs() {
        let config = ServerConfig {
            port: 3000,
            internal_port: 3001,
            host: "0.0.0.0".to_string(),
            ..Default::default()
        };
        assert_eq!(config.socket_addr(), "0.0.0.0:3000");
        assert_eq!(config.internal_socket_addr(), "0.0.0.0:3001");
    }

    #[test]
    fn test_validate_valid() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_keys_outside_dev_mode() {
        let errors = ServerConfig::default().validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("key set")));

        let dev = ServerConfig {
            dev_mode: true,
            ..Default::default()
        };
        assert!(dev.validate().is_ok());
    }

    #[test]
    fn test_validate_upstreams() {
        let config = ServerConfig {
            loki_url: "ftp://logs".to_string(),
            thanos_headers: vec!["X-Scope-OrgID=ops".to_string(), "broken".to_string()],
            thanos_cert: Some("/tls/tls.crt".to_string()),
            ..valid()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("LogQL upstream URL")));
        assert!(errors.iter().any(|e| e.contains("'broken'")));
        assert!(errors.iter().any(|e| e.contains("certificate and key")));
    }

    #[test]
    fn test_validate_label_store() {
        let unknown = ServerConfig {
            label_store: "ldap".to_string(),
            ..valid()
        };
        assert!(unknown.validate().is_err());

        let sqlite = ServerConfig {
            label_store: "sqlite".to_string(),
            ..valid()
        };
        assert!(sqlite.validate().is_err());
    }

    #[test]
    fn test_upstream_settings() {
        let config = ServerConfig {
            loki_mutual_auth: true,
            loki_actor_header: Some("X-Actor".to_string()),
            ..valid()
        };
        let loki = config.upstream(Dialect::Logql);
        assert!(loki.mutual_auth);
        assert_eq!(loki.actor_header, Some("X-Actor"));
        assert!(!config.upstream(Dialect::Promql).mutual_auth);
        assert!(config.needs_service_token());
    }

    #[test]
    fn test_header_values_keep_commas() {
        let config =
            ServerConfig::try_parse_from(["gatekeep", "--thanos-headers", "Accept=a, b"]).unwrap();
        assert_eq!(config.thanos_headers, vec!["Accept=a, b".to_string()]);

        let config = ServerConfig::try_parse_from([
            "gatekeep",
            "--loki-headers",
            "X-Org=ops",
            "--loki-headers",
            "Cache-Control=no-cache, no-store",
        ])
        .unwrap();
        assert_eq!(
            config.loki_headers,
            vec!["X-Org=ops".to_string(), "Cache-Control=no-cache, no-store".to_string()]
        );

        let config =
            ServerConfig::try_parse_from(["gatekeep", "--thanos-headers", "A=1\nB=2, 3"]).unwrap();
        assert_eq!(config.thanos_headers, vec!["A=1".to_string(), "B=2, 3".to_string()]);
    }

    #[test]
    fn test_parse_header_pair() {
        assert_eq!(parse_header_pair("A=b=c"), Some(("A", "b=c")));
        assert_eq!(parse_header_pair(" X-Org = ops "), Some(("X-Org", "ops")));
        assert_eq!(parse_header_pair("=v"), None);
        assert_eq!(parse_header_pair("novalue"), None);
    }

    #[test]
    fn test_for_testing() {
        let config = ServerConfig::for_testing();
        assert_eq!(config.port, 0);
        assert!(config.dev_mode);
        assert!(config.validate().is_err());
    }
}
