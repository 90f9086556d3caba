//! Rotating JSON Web Key Set.
//!
//! Keys are held in an immutable snapshot behind an [`ArcSwap`]. A refresh
//! fetches the remote set, builds a new snapshot and swaps it in; concurrent
//! verifications keep using whichever snapshot they loaded. A failed refresh
//! leaves the previous keys in place and marks the cache unhealthy.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use jsonwebtoken::jwk::{JwkSet, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::AuthError;

/// Errors loading a key set.
#[derive(Debug, Error)]
pub enum KeySetError {
    /// The key set endpoint could not be reached or answered with an error.
    #[error("failed to fetch key set from {url}: {source}")]
    Fetch {
        /// Key set endpoint.
        url: String,
        /// Transport or status error.
        #[source]
        source: reqwest::Error,
    },

    /// The document is not a JWK set.
    #[error("invalid key set document: {0}")]
    Parse(#[from] serde_json::Error),

    /// No usable key was found.
    #[error("key set contains no usable keys")]
    Empty,
}

#[derive(Clone)]
struct CachedKey {
    key: DecodingKey,
    algorithm: Option<Algorithm>,
}

type KeyMap = HashMap<String, CachedKey>;

struct RemoteSource {
    url: Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl RemoteSource {
    async fn fetch(&self) -> Result<JwkSet, KeySetError> {
        let fetch_error = |source| KeySetError::Fetch {
            url: self.url.to_string(),
            source,
        };
        self.client
            .get(self.url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(fetch_error)?
            .json::<JwkSet>()
            .await
            .map_err(fetch_error)
    }
}

/// Verification keys indexed by key ID.
pub struct JwksCache {
    remote: Option<RemoteSource>,
    static_keys: KeyMap,
    keys: ArcSwap<KeyMap>,
    last_refresh: Mutex<Option<Instant>>,
    min_refresh_interval: Duration,
    refresh_lock: tokio::sync::Mutex<()>,
    healthy: AtomicBool,
}

impl fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwksCache")
            .field("url", &self.remote.as_ref().map(|r| r.url.as_str()))
            .field("keys", &self.len())
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

impl JwksCache {
    /// Creates a cache over a fixed key set document.
    pub fn from_static(document: &str) -> Result<Self, KeySetError> {
        let keys = build_keys(&serde_json::from_str(document)?);
        if keys.is_empty() {
            return Err(KeySetError::Empty);
        }
        Ok(Self::with_keys(None, keys, Duration::ZERO))
    }

    /// Creates a cache fetching keys from `url`.
    ///
    /// `static_document` keys are merged into every fetched snapshot. The cache
    /// starts empty; call [`JwksCache::refresh`] before serving.
    pub fn remote(
        url: Url,
        client: reqwest::Client,
        timeout: Duration,
        min_refresh_interval: Duration,
        static_document: Option<&str>,
    ) -> Result<Self, KeySetError> {
        let static_keys = match static_document {
            Some(document) => build_keys(&serde_json::from_str(document)?),
            None => KeyMap::new(),
        };
        let remote = RemoteSource {
            url,
            client,
            timeout,
        };
        Ok(Self::with_keys(Some(remote), static_keys, min_refresh_interval))
    }

    fn with_keys(
        remote: Option<RemoteSource>,
        static_keys: KeyMap,
        min_refresh_interval: Duration,
    ) -> Self {
        Self {
            remote,
            keys: ArcSwap::from_pointee(static_keys.clone()),
            static_keys,
            last_refresh: Mutex::new(None),
            min_refresh_interval,
            refresh_lock: tokio::sync::Mutex::new(()),
            healthy: AtomicBool::new(true),
        }
    }

    /// Number of keys in the current snapshot.
    pub fn len(&self) -> usize {
        self.keys.load().len()
    }

    /// Returns true if no key is loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns false after a failed refresh until the next successful one.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Fetches the remote key set and swaps it in. Returns the key count.
    pub async fn refresh(&self) -> Result<usize, KeySetError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<usize, KeySetError> {
        let Some(remote) = &self.remote else {
            return Ok(self.len());
        };
        *self.last_refresh.lock() = Some(Instant::now());

        let fetched = remote.fetch().await.and_then(|set| {
            let mut keys = build_keys(&set);
            keys.extend(self.static_keys.clone());
            if keys.is_empty() {
                Err(KeySetError::Empty)
            } else {
                Ok(keys)
            }
        });

        match fetched {
            Ok(keys) => {
                let count = keys.len();
                self.keys.store(Arc::new(keys));
                self.healthy.store(true, Ordering::Release);
                info!(url = %remote.url, keys = count, "refreshed key set");
                Ok(count)
            }
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Refreshes the key set every `interval` until the handle is aborted.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh().await {
                    error!(error = %e, "failed to refresh key set");
                }
            }
        })
    }

    /// Refreshes for an unknown key ID, at most once per minimum interval.
    async fn refresh_for_unknown(&self, kid: &str) {
        if self.remote.is_none() {
            return;
        }
        let _guard = self.refresh_lock.lock().await;
        if self.key(kid).is_some() {
            return;
        }
        let recent = self
            .last_refresh
            .lock()
            .is_some_and(|at| at.elapsed() < self.min_refresh_interval);
        if recent {
            debug!(kid, "unknown key id, refresh rate limited");
            return;
        }
        debug!(kid, "unknown key id, refreshing key set");
        if let Err(e) = self.refresh_locked().await {
            warn!(error = %e, "on-demand key set refresh failed");
        }
    }

    fn key(&self, kid: &str) -> Option<CachedKey> {
        self.keys.load().get(kid).cloned()
    }

    /// Verifies `token` and returns its claims.
    ///
    /// `exp` and `nbf` are checked when present; the audience is not.
    pub async fn verify(&self, token: &str) -> Result<Map<String, Value>, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| AuthError::InvalidSignature("token has no key id".to_string()))?;

        let cached = match self.key(kid) {
            Some(cached) => cached,
            None => {
                self.refresh_for_unknown(kid).await;
                self.key(kid)
                    .ok_or_else(|| AuthError::UnknownKey(kid.to_string()))?
            }
        };

        if cached.algorithm.is_some_and(|alg| alg != header.alg) {
            return Err(AuthError::InvalidSignature(format!(
                "algorithm {:?} does not match key {}",
                header.alg, kid
            )));
        }

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;
        validation.validate_nbf = true;
        validation.required_spec_claims.clear();

        jsonwebtoken::decode::<Map<String, Value>>(token, &cached.key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidSignature(e.to_string()))
    }
}

fn signing_algorithm(algorithm: &KeyAlgorithm) -> Option<Algorithm> {
    match algorithm {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

/// Builds decoding keys from a set, skipping keys without an ID, encryption
/// keys and keys that fail to load.
fn build_keys(set: &JwkSet) -> KeyMap {
    let mut keys = KeyMap::new();
    for jwk in &set.keys {
        let Some(kid) = jwk.common.key_id.clone() else {
            warn!("skipping key without key id");
            continue;
        };
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            debug!(kid, "skipping encryption key");
            continue;
        }
        let algorithm = jwk.common.key_algorithm.as_ref().and_then(signing_algorithm);
        match DecodingKey::from_jwk(jwk) {
            Ok(key) => {
                keys.insert(kid, CachedKey { key, algorithm });
            }
            Err(e) => warn!(kid, error = %e, "skipping unusable key"),
        }
    }
    keys
}
