//! Configuration management
//!
//! Layering, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. YAML file (`--config`)
//! 3. `SANDBOX_MCP_` prefixed environment (`__` separates sections)
//! 4. The deployment variables the service has always read
//!    (`AUTH0_DOMAIN`, `AUTH0_AUDIENCE`, `PORT`, ...)
//!
//! A `.env` file in the working directory is loaded into the process
//! environment before any of the above are evaluated.

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Plain environment variables recognised for backwards compatibility,
/// with the config key each one lands on.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("AUTH0_DOMAIN", "auth.domain"),
    ("AUTH0_AUDIENCE", "auth.audience"),
    ("AUTH0_CLIENT_ID", "auth.client_id"),
    ("AUTH0_CLIENT_SECRET", "auth.client_secret"),
    ("SANDBOX_API_KEY", "upstream.api_key"),
    ("SANDBOX_API_HOSTNAME", "upstream.base_url"),
    ("PORT", "server.port"),
];

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Inbound authentication configuration
    pub auth: AuthConfig,
    /// Upstream sandbox API configuration
    pub upstream: UpstreamConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Maximum number of requests processed concurrently
    pub max_concurrent_requests: usize,
    /// Keep-alive interval for legacy SSE streams
    #[serde(with = "humantime_serde")]
    pub sse_keep_alive: Duration,
    /// Streamable HTTP sessions unused for this long are closed
    #[serde(with = "humantime_serde")]
    pub session_idle_timeout: Duration,
    /// Maximum number of live sessions across both transports
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9100,
            max_body_size: 1024 * 1024,
            max_concurrent_requests: 256,
            sse_keep_alive: Duration::from_secs(15),
            session_idle_timeout: Duration::from_secs(30 * 60),
            max_sessions: 10_000,
        }
    }
}

/// Inbound authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Identity provider domain, e.g. `tenant.eu.auth0.com`
    pub domain: String,
    /// Audience every accepted token must carry
    pub audience: String,
    /// OAuth client id (only needed when the gateway itself acts as a client)
    pub client_id: Option<String>,
    /// OAuth client secret (only needed when the gateway itself acts as a client)
    pub client_secret: Option<String>,
    /// Expected issuer; defaults to `https://{domain}/`
    pub issuer: Option<String>,
    /// Key set endpoint; defaults to `https://{domain}/.well-known/jwks.json`
    pub jwks_url: Option<String>,
    /// Accept OAuth2/JWT bearer tokens
    pub jwt_enabled: bool,
    /// Clock-skew tolerance applied to `exp`, `nbf` and `iat`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
    /// Background key set refresh interval
    #[serde(with = "humantime_serde")]
    pub jwks_refresh_interval: Duration,
    /// Minimum spacing between refreshes triggered by an unknown key id
    #[serde(with = "humantime_serde")]
    pub jwks_miss_cooldown: Duration,
    /// Timeout for a single key set fetch
    #[serde(with = "humantime_serde")]
    pub jwks_fetch_timeout: Duration,
    /// Accept legacy `ApiKey` credentials
    pub legacy_api_keys: bool,
    /// Locally provisioned legacy API key. When unset, legacy keys are
    /// passed through and validated by the upstream.
    pub api_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            audience: String::new(),
            client_id: None,
            client_secret: None,
            issuer: None,
            jwks_url: None,
            jwt_enabled: true,
            leeway: Duration::from_secs(60),
            jwks_refresh_interval: Duration::from_secs(15 * 60),
            jwks_miss_cooldown: Duration::from_secs(10),
            jwks_fetch_timeout: Duration::from_secs(10),
            legacy_api_keys: true,
            api_key: None,
        }
    }
}

impl AuthConfig {
    /// The issuer tokens must carry
    #[must_use]
    pub fn issuer(&self) -> String {
        self.issuer
            .clone()
            .unwrap_or_else(|| format!("https://{}/", self.domain.trim_end_matches('/')))
    }

    /// Where the identity provider publishes its signing keys
    #[must_use]
    pub fn jwks_url(&self) -> String {
        self.jwks_url.clone().unwrap_or_else(|| {
            format!(
                "https://{}/.well-known/jwks.json",
                self.domain.trim_end_matches('/')
            )
        })
    }
}

/// Upstream sandbox API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the sandbox API
    pub base_url: String,
    /// API key forwarded for callers that authenticated with a legacy key
    pub api_key: Option<String>,
    /// Timeout for ordinary calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Timeout for query execution calls
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.sandbox.neo4j.com".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    /// Load configuration from `.env`, an optional file and the environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or the resulting configuration is inconsistent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(env_path) => tracing::debug!("Loaded env file: {}", env_path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!("Failed to load .env: {e}"),
        }

        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment
            .merge(Env::prefixed("SANDBOX_MCP_").split("__"))
            .merge(legacy_env());

        Self::from_figment(&figment)
    }

    /// Extract and validate a configuration from an assembled figment
    ///
    /// # Errors
    ///
    /// Returns an error if extraction or validation fails.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let auth = &self.auth;

        if !auth.jwt_enabled && !auth.legacy_api_keys {
            return Err(Error::Config(
                "No authentication method enabled (jwt_enabled and legacy_api_keys are both false)"
                    .to_string(),
            ));
        }

        if auth.jwt_enabled {
            let has_endpoints = auth.issuer.is_some() && auth.jwks_url.is_some();
            if auth.domain.trim().is_empty() && !has_endpoints {
                return Err(Error::Config(
                    "AUTH0_DOMAIN (auth.domain) is required when JWT authentication is enabled"
                        .to_string(),
                ));
            }
            if auth.audience.trim().is_empty() {
                return Err(Error::Config(
                    "AUTH0_AUDIENCE (auth.audience) is required when JWT authentication is enabled"
                        .to_string(),
                ));
            }
            Url::parse(&auth.jwks_url())
                .map_err(|e| Error::Config(format!("Invalid JWKS URL: {e}")))?;
        }

        if auth.api_key.as_deref().is_some_and(str::is_empty) {
            return Err(Error::Config("auth.api_key must not be empty".to_string()));
        }

        let base = Url::parse(&self.upstream.base_url)
            .map_err(|e| Error::Config(format!("Invalid upstream base URL: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "Upstream base URL cannot carry a path: {base}"
            )));
        }

        Ok(())
    }
}

/// Provider for the plain deployment variables in [`LEGACY_ENV_KEYS`]
fn legacy_env() -> Env {
    let names: Vec<&str> = LEGACY_ENV_KEYS.iter().map(|(name, _)| *name).collect();
    Env::raw()
        .only(&names)
        .map(|key| map_legacy_env_key(key.as_str()).unwrap_or(key.as_str()).to_string().into())
}

/// Map a legacy environment variable name onto its config key
#[must_use]
pub fn map_legacy_env_key(name: &str) -> Option<&'static str> {
    LEGACY_ENV_KEYS
        .iter()
        .find(|(env_name, _)| env_name.eq_ignore_ascii_case(name))
        .map(|(_, key)| *key)
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 && duration.as_secs() == 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "1h", "100ms" or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
