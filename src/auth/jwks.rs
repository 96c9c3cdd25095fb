//! Identity provider key material - JWKS fetching and caching.
//!
//! # Refresh model
//!
//! - The cache holds one immutable [`KeySet`] snapshot behind an `Arc`.
//!   Readers clone the `Arc` under a short read lock; a refresh builds a new
//!   set and swaps it in whole.
//! - At most one fetch is in flight. Concurrent callers of
//!   [`KeyMaterialCache::refresh`] await the same shared future, which runs
//!   on its own task so a cancelled caller does not abandon the others.
//! - A failed fetch leaves the current snapshot untouched.
//! - Refreshes triggered by an unknown `kid` are spaced by a cooldown;
//!   scheduled refreshes are not.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use jsonwebtoken::{
    Algorithm, DecodingKey,
    jwk::{AlgorithmParameters, EllipticCurve, Jwk, PublicKeyUse},
};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::KeyFetchError;
use crate::config::AuthConfig;

/// A verification key from the provider's key set
#[derive(Clone)]
pub struct VerificationKey {
    /// Key id (`kid`)
    pub kid: String,
    /// Key usable by `jsonwebtoken`
    pub key: DecodingKey,
    /// Signature algorithms this key can verify
    pub algorithms: &'static [Algorithm],
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("algorithms", &self.algorithms)
            .finish_non_exhaustive()
    }
}

const RSA_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
];
const P256_ALGORITHMS: &[Algorithm] = &[Algorithm::ES256];
const P384_ALGORITHMS: &[Algorithm] = &[Algorithm::ES384];

/// Immutable snapshot of the provider's signing keys, keyed by `kid`
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, VerificationKey>,
}

#[derive(Deserialize)]
struct RawJwks {
    keys: Vec<serde_json::Value>,
}

impl KeySet {
    /// Parse a JWKS document
    ///
    /// Keys that are not RSA or EC (P-256/P-384) signing keys, or that have
    /// no `kid`, are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`KeyFetchError::InvalidKeySet`] if the document is not a JWKS.
    pub fn from_json(body: &[u8]) -> Result<Self, KeyFetchError> {
        let raw: RawJwks = serde_json::from_slice(body)
            .map_err(|e| KeyFetchError::InvalidKeySet(e.to_string()))?;

        let mut keys = HashMap::with_capacity(raw.keys.len());
        for value in raw.keys {
            let jwk: Jwk = match serde_json::from_value(value) {
                Ok(jwk) => jwk,
                Err(e) => {
                    debug!(error = %e, "Skipping unparseable JWK");
                    continue;
                }
            };
            if let Some(key) = convert_jwk(&jwk) {
                keys.insert(key.kid.clone(), key);
            }
        }

        Ok(Self { keys })
    }

    /// Build a key set from already converted keys
    #[must_use]
    pub fn from_keys(keys: impl IntoIterator<Item = VerificationKey>) -> Self {
        Self {
            keys: keys.into_iter().map(|k| (k.kid.clone(), k)).collect(),
        }
    }

    /// Look up a key by id
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.get(kid)
    }

    /// Number of usable keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set holds no usable keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key ids in the set, sorted
    #[must_use]
    pub fn kids(&self) -> Vec<&str> {
        let mut kids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        kids.sort_unstable();
        kids
    }
}

/// Convert a JWK into a verification key, or `None` if unsupported
fn convert_jwk(jwk: &Jwk) -> Option<VerificationKey> {
    let Some(kid) = jwk.common.key_id.clone() else {
        debug!("Skipping JWK without kid");
        return None;
    };

    if let Some(usage) = &jwk.common.public_key_use
        && !matches!(usage, PublicKeyUse::Signature)
    {
        debug!(kid = %kid, "Skipping non-signing JWK");
        return None;
    }

    let (key, algorithms) = match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => (
            DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok()?,
            RSA_ALGORITHMS,
        ),
        AlgorithmParameters::EllipticCurve(ec) => {
            let algorithms = match ec.curve {
                EllipticCurve::P256 => P256_ALGORITHMS,
                EllipticCurve::P384 => P384_ALGORITHMS,
                _ => {
                    debug!(kid = %kid, "Skipping JWK with unsupported curve");
                    return None;
                }
            };
            (DecodingKey::from_ec_components(&ec.x, &ec.y).ok()?, algorithms)
        }
        AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => {
            debug!(kid = %kid, "Skipping symmetric or OKP JWK");
            return None;
        }
    };

    Some(VerificationKey {
        kid,
        key,
        algorithms,
    })
}

/// Source of key sets
#[async_trait]
pub trait JwksFetcher: Send + Sync + 'static {
    /// Fetch the provider's current key set
    async fn fetch(&self) -> Result<KeySet, KeyFetchError>;
}

/// Fetches the key set over HTTP(S)
pub struct HttpJwksFetcher {
    http: reqwest::Client,
    url: String,
}

impl HttpJwksFetcher {
    /// Create a fetcher for `url`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, KeyFetchError> {
        let url = url.into();
        if !url.starts_with("https://") {
            warn!(url = %url, "JWKS URL is not HTTPS");
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KeyFetchError::Request(e.to_string()))?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl JwksFetcher for HttpJwksFetcher {
    async fn fetch(&self) -> Result<KeySet, KeyFetchError> {
        debug!(url = %self.url, "Fetching JWKS");
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| KeyFetchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeyFetchError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| KeyFetchError::Request(e.to_string()))?;
        KeySet::from_json(&body)
    }
}

type RefreshResult = Result<Arc<KeySet>, KeyFetchError>;
type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Process-wide owner of the provider's key material
pub struct KeyMaterialCache {
    snapshot: Arc<RwLock<Arc<KeySet>>>,
    fetcher: Arc<dyn JwksFetcher>,
    inflight: Arc<Mutex<Option<(u64, SharedRefresh)>>>,
    generation: AtomicU64,
    fetches: Arc<AtomicU64>,
    last_miss_refresh: Mutex<Option<Instant>>,
    miss_cooldown: Duration,
}

impl KeyMaterialCache {
    /// Create an empty cache around `fetcher`
    #[must_use]
    pub fn new(fetcher: Arc<dyn JwksFetcher>, miss_cooldown: Duration) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(Arc::new(KeySet::default()))),
            fetcher,
            inflight: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            fetches: Arc::new(AtomicU64::new(0)),
            last_miss_refresh: Mutex::new(None),
            miss_cooldown,
        }
    }

    /// Create a cache fetching from the configured JWKS endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn from_config(config: &AuthConfig) -> Result<Self, KeyFetchError> {
        let fetcher = HttpJwksFetcher::new(config.jwks_url(), config.jwks_fetch_timeout)?;
        Ok(Self::new(Arc::new(fetcher), config.jwks_miss_cooldown))
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<KeySet> {
        Arc::clone(&self.snapshot.read())
    }

    /// Look up a key in the current snapshot
    #[must_use]
    pub fn get_key(&self, kid: &str) -> Option<VerificationKey> {
        self.snapshot.read().get(kid).cloned()
    }

    /// Number of fetches issued so far
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Fetch the key set and swap it in, joining any fetch already running
    ///
    /// # Errors
    ///
    /// Returns the fetch error; the previous snapshot stays in place.
    pub async fn refresh(&self) -> RefreshResult {
        let shared = {
            let mut slot = self.inflight.lock();
            self.join_or_start(&mut slot)
        };
        shared.await
    }

    /// Refresh because a token named `kid` and the snapshot lacks it
    ///
    /// Joins a running fetch if there is one. Otherwise starts one unless the
    /// previous miss-triggered refresh is younger than the cooldown, in which
    /// case the current snapshot is returned as is.
    ///
    /// # Errors
    ///
    /// Returns the fetch error; the previous snapshot stays in place.
    pub async fn refresh_for_unknown_kid(&self, kid: &str) -> RefreshResult {
        // The inflight slot stays locked across the cooldown check so a
        // concurrent miss either joins this fetch or sees the cooldown.
        let shared = {
            let mut slot = self.inflight.lock();
            let running = slot
                .as_ref()
                .filter(|(_, fut)| fut.peek().is_none())
                .map(|(_, fut)| fut.clone());
            if let Some(running) = running {
                debug!(kid = %kid, "Joining in-flight JWKS refresh");
                running
            } else {
                let mut last = self.last_miss_refresh.lock();
                if let Some(at) = *last
                    && at.elapsed() < self.miss_cooldown
                {
                    debug!(kid = %kid, "Unknown kid within refresh cooldown, not refetching");
                    return Ok(self.snapshot());
                }
                *last = Some(Instant::now());
                debug!(kid = %kid, "Key not in cached JWKS, refreshing");
                self.join_or_start(&mut slot)
            }
        };
        shared.await
    }

    fn join_or_start(&self, slot: &mut Option<(u64, SharedRefresh)>) -> SharedRefresh {
        match slot.as_ref() {
            Some((_, running)) if running.peek().is_none() => running.clone(),
            _ => {
                let id = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let shared = self.spawn_fetch(id);
                *slot = Some((id, shared.clone()));
                shared
            }
        }
    }

    fn spawn_fetch(&self, id: u64) -> SharedRefresh {
        let fetcher = Arc::clone(&self.fetcher);
        let snapshot = Arc::clone(&self.snapshot);
        let inflight = Arc::clone(&self.inflight);
        let fetches = Arc::clone(&self.fetches);

        let handle = tokio::spawn(async move {
            fetches.fetch_add(1, Ordering::Relaxed);
            let result = match fetcher.fetch().await {
                Ok(set) if set.is_empty() => {
                    Err(KeyFetchError::InvalidKeySet("no usable signing keys".into()))
                }
                Ok(set) => {
                    let set = Arc::new(set);
                    *snapshot.write() = Arc::clone(&set);
                    info!(keys = set.len(), kids = ?set.kids(), "JWKS refreshed");
                    Ok(set)
                }
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                let kept = snapshot.read().len();
                warn!(error = %e, kept_keys = kept, "JWKS refresh failed, keeping cached keys");
            }

            let mut slot = inflight.lock();
            if slot.as_ref().is_some_and(|(current, _)| *current == id) {
                *slot = None;
            }
            result
        });

        async move {
            handle
                .await
                .map_err(|e| KeyFetchError::TaskFailed(e.to_string()))?
        }
        .boxed()
        .shared()
    }

    /// Refresh on a fixed interval until `shutdown` fires
    ///
    /// The first refresh happens one `interval` after the call; the initial
    /// load is the caller's job.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        debug!("JWKS refresh loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        // Failures are logged inside the fetch task
                        let _ = self.refresh().await;
                    }
                }
            }
        })
    }
}
