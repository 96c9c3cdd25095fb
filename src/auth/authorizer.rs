//! Per-call authorization.
//!
//! Every tool call moves through
//! `Unauthenticated -> Verifying -> {Authenticated, Rejected}`:
//!
//! - no `Authorization` header: rejected with `MissingCredential`
//! - JWT-shaped credential: verified as a JWT; an unknown `kid` triggers one
//!   key refresh and one retry. Any other failure falls back to the locally
//!   provisioned API key, and if that fails too the JWT error is reported.
//! - anything else bearer-shaped: legacy API key path
//!
//! Legacy keys are compared locally when one is provisioned. Otherwise they
//! are passed through for the upstream to validate.

use std::sync::Arc;

use tracing::{debug, warn};

use super::credential::{
    AuthMethod, AuthenticatedCaller, Credential, ForwardedCredential, IdentityContext,
    fingerprint,
};
use super::error::AuthError;
use super::jwks::KeyMaterialCache;
use super::verifier::CredentialVerifier;
use crate::config::Config;

/// Decides whether a tool call may proceed and what to forward upstream
pub struct Authorizer {
    verifier: CredentialVerifier,
    keys: Arc<KeyMaterialCache>,
    jwt_enabled: bool,
    legacy_api_keys: bool,
    upstream_api_key: Option<String>,
}

impl Authorizer {
    /// Create an authorizer that owns a handle to the shared key cache
    #[must_use]
    pub fn new(verifier: CredentialVerifier, keys: Arc<KeyMaterialCache>) -> Self {
        Self {
            verifier,
            keys,
            jwt_enabled: true,
            legacy_api_keys: true,
            upstream_api_key: None,
        }
    }

    /// Build from configuration
    #[must_use]
    pub fn from_config(config: &Config, keys: Arc<KeyMaterialCache>) -> Self {
        Self {
            verifier: CredentialVerifier::from_config(&config.auth),
            keys,
            jwt_enabled: config.auth.jwt_enabled,
            legacy_api_keys: config.auth.legacy_api_keys,
            upstream_api_key: config.upstream.api_key.clone(),
        }
    }

    /// Enable or disable JWT verification
    #[must_use]
    pub fn with_jwt(mut self, enabled: bool) -> Self {
        self.jwt_enabled = enabled;
        self
    }

    /// Enable or disable legacy API keys
    #[must_use]
    pub fn with_legacy_api_keys(mut self, enabled: bool) -> Self {
        self.legacy_api_keys = enabled;
        self
    }

    /// Key the upstream receives for locally verified API-key callers
    #[must_use]
    pub fn with_upstream_api_key(mut self, key: impl Into<String>) -> Self {
        self.upstream_api_key = Some(key.into());
        self
    }

    /// Authorize one call from its `Authorization` header value
    ///
    /// # Errors
    ///
    /// Returns the most specific [`AuthError`] when no path accepts the
    /// credential.
    pub async fn authorize(
        &self,
        authorization: Option<&str>,
    ) -> Result<AuthenticatedCaller, AuthError> {
        let Some(header) = authorization.filter(|h| !h.trim().is_empty()) else {
            debug!("Rejected call without credential");
            return Err(AuthError::MissingCredential);
        };

        let credential = Credential::parse(header);
        let result = match &credential {
            Credential::Jwt(token) if self.jwt_enabled => match self.verify_jwt(token).await {
                Ok(identity) => Ok(AuthenticatedCaller {
                    identity,
                    forward: ForwardedCredential::Bearer(token.clone()),
                }),
                Err(jwt_error) => self.fallback_to_local_key(token, jwt_error),
            },
            Credential::Jwt(token) | Credential::ApiKey(token) => self.verify_static_key(token),
            Credential::Unrecognized => Err(AuthError::MalformedCredential(
                "unsupported authorization scheme".into(),
            )),
        };

        let tag = credential.secret().map(fingerprint);
        match &result {
            Ok(caller) => debug!(
                method = caller.identity.method.as_str(),
                subject = %caller.identity.subject,
                credential = tag.as_deref().unwrap_or("-"),
                "Caller authenticated"
            ),
            Err(e) => warn!(
                reason = e.reason(),
                error = %e,
                credential = tag.as_deref().unwrap_or("-"),
                "Authentication failed"
            ),
        }
        result
    }

    async fn verify_jwt(&self, token: &str) -> Result<IdentityContext, AuthError> {
        let keys = self.keys.snapshot();
        match self.verifier.verify_jwt(token, &keys) {
            Err(AuthError::UnknownKey(kid)) => {
                let keys = match self.keys.refresh_for_unknown_kid(&kid).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!(kid = %kid, error = %e, "Key refresh failed, retrying with cached keys");
                        self.keys.snapshot()
                    }
                };
                self.verifier.verify_jwt(token, &keys)
            }
            other => other,
        }
    }

    /// A JWT-shaped credential may still be the provisioned static key.
    /// Only a local match counts here; it is never passed through.
    fn fallback_to_local_key(
        &self,
        token: &str,
        jwt_error: AuthError,
    ) -> Result<AuthenticatedCaller, AuthError> {
        if self.legacy_api_keys
            && self.verifier.has_local_api_key()
            && let Ok(caller) = self.verify_static_key(token)
        {
            return Ok(caller);
        }
        Err(jwt_error)
    }

    fn verify_static_key(&self, key: &str) -> Result<AuthenticatedCaller, AuthError> {
        if !self.legacy_api_keys {
            return Err(AuthError::InvalidApiKey);
        }

        if self.verifier.has_local_api_key() {
            let identity = self.verifier.verify_api_key(key)?;
            let forwarded = self
                .upstream_api_key
                .clone()
                .unwrap_or_else(|| key.to_string());
            return Ok(AuthenticatedCaller {
                identity,
                forward: ForwardedCredential::ApiKey(forwarded),
            });
        }

        // Nothing to compare against: the upstream decides, so it must see
        // the caller's own key and never the gateway's.
        Ok(AuthenticatedCaller {
            identity: IdentityContext::api_key(key, AuthMethod::DelegatedApiKey),
            forward: ForwardedCredential::ApiKey(key.to_string()),
        })
    }
}
