//! Credential parsing and the identity attached to an authenticated call.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// A bearer credential as presented by the caller
///
/// Parsed once from the `Authorization` header; verification matches on the
/// variant.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// A compact JWS (three base64url segments) or JWE (five segments)
    Jwt(String),
    /// A legacy static API key
    ApiKey(String),
    /// A header value the gateway cannot interpret
    Unrecognized,
}

impl Credential {
    /// Parse an `Authorization` header value
    ///
    /// - `Bearer ApiKey <key>` and `ApiKey <key>` are API keys
    /// - `Bearer <token>` is a JWT when token-shaped, an API key otherwise
    /// - anything else is [`Credential::Unrecognized`]
    #[must_use]
    pub fn parse(header: &str) -> Self {
        let header = header.trim();

        if let Some(key) = strip_scheme(header, "ApiKey") {
            return non_empty(key).map_or(Self::Unrecognized, |k| Self::ApiKey(k.to_string()));
        }

        let Some(value) = strip_scheme(header, "Bearer") else {
            return Self::Unrecognized;
        };

        if let Some(key) = strip_scheme(value, "ApiKey") {
            return non_empty(key).map_or(Self::Unrecognized, |k| Self::ApiKey(k.to_string()));
        }
        if value.eq_ignore_ascii_case("ApiKey") {
            return Self::Unrecognized;
        }

        match non_empty(value) {
            Some(token) if is_token_shaped(token) => Self::Jwt(token.to_string()),
            Some(key) if !key.contains(char::is_whitespace) => Self::ApiKey(key.to_string()),
            _ => Self::Unrecognized,
        }
    }

    /// Raw secret carried by the credential, if any
    #[must_use]
    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::Jwt(s) | Self::ApiKey(s) => Some(s),
            Self::Unrecognized => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jwt(t) => write!(f, "Jwt({})", fingerprint(t)),
            Self::ApiKey(k) => write!(f, "ApiKey({})", fingerprint(k)),
            Self::Unrecognized => f.write_str("Unrecognized"),
        }
    }
}

fn strip_scheme<'a>(value: &'a str, scheme: &str) -> Option<&'a str> {
    let (head, rest) = value.split_once(char::is_whitespace)?;
    head.eq_ignore_ascii_case(scheme).then(|| rest.trim())
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

fn is_base64url_segment(segment: &str) -> bool {
    segment
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Three non-empty base64url segments (JWS), or five segments (JWE, whose
/// key segment may be empty)
fn is_token_shaped(token: &str) -> bool {
    let segments: Vec<&str> = token.split('.').collect();
    match segments.len() {
        3 => segments
            .iter()
            .all(|s| !s.is_empty() && is_base64url_segment(s)),
        5 => {
            !segments[0].is_empty()
                && !segments[3].is_empty()
                && segments.iter().all(|s| is_base64url_segment(s))
        }
        _ => false,
    }
}

/// Short, non-reversible tag for a secret, safe to log
#[must_use]
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..8])
}

/// How the caller authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Locally verified JWT
    Jwt,
    /// API key matched against the locally provisioned key
    ApiKey,
    /// API key passed through for the upstream to validate
    DelegatedApiKey,
}

impl AuthMethod {
    /// Label used in logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jwt => "jwt",
            Self::ApiKey => "api_key",
            Self::DelegatedApiKey => "delegated_api_key",
        }
    }
}

/// Who is calling, as established by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityContext {
    /// `sub` claim, or a key fingerprint for API-key callers
    pub subject: String,
    /// Union of the `scope` and `permissions` claims
    pub scopes: Vec<String>,
    /// `exp` claim
    pub expires_at: Option<DateTime<Utc>>,
    /// `iss` claim
    pub issuer: Option<String>,
    /// `email` claim
    pub email: Option<String>,
    /// How the identity was established
    pub method: AuthMethod,
}

impl IdentityContext {
    /// Identity for a legacy API-key caller
    #[must_use]
    pub fn api_key(key: &str, method: AuthMethod) -> Self {
        Self {
            subject: format!("api-key:{}", fingerprint(key)),
            scopes: Vec::new(),
            expires_at: None,
            issuer: None,
            email: None,
            method,
        }
    }

    /// Whether the identity carries `scope`
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Credential the upstream receives on behalf of the caller
#[derive(Clone, PartialEq, Eq)]
pub enum ForwardedCredential {
    /// The caller's JWT, forwarded unchanged
    Bearer(String),
    /// An API key
    ApiKey(String),
}

impl ForwardedCredential {
    /// Value for the upstream `Authorization` header
    #[must_use]
    pub fn authorization_header(&self) -> String {
        match self {
            Self::Bearer(token) => format!("Bearer {token}"),
            Self::ApiKey(key) => format!("ApiKey {key}"),
        }
    }
}

impl fmt::Debug for ForwardedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer(t) => write!(f, "Bearer({})", fingerprint(t)),
            Self::ApiKey(k) => write!(f, "ApiKey({})", fingerprint(k)),
        }
    }
}

/// Result of successful authorization, attached to a tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedCaller {
    /// Who the caller is
    pub identity: IdentityContext,
    /// What to send upstream
    pub forward: ForwardedCredential,
}
