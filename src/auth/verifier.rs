//! Credential verification - pure checks against a key set snapshot.
//!
//! # Token checks, in order
//!
//! 1. Shape: compact JWS with three segments. Five-segment JWE and the
//!    `none`, `dir` and `HS*` algorithms are refused outright.
//! 2. `kid` present and known to the key set.
//! 3. Header `alg` is one the key can verify.
//! 4. Signature, then `iss`, `aud`, `exp`, `nbf` with clock leeway.
//! 5. `iat` not in the future (jsonwebtoken does not check it).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::credential::{AuthMethod, Credential, IdentityContext};
use super::error::{AuthError, ClaimViolation};
use super::jwks::KeySet;
use crate::config::AuthConfig;

/// Validates credentials against the configured issuer and audience
#[derive(Clone)]
pub struct CredentialVerifier {
    issuer: String,
    audience: String,
    leeway_secs: u64,
    api_key: Option<String>,
}

impl std::fmt::Debug for CredentialVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVerifier")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("leeway_secs", &self.leeway_secs)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Just enough of the JOSE header to refuse what we never verify
#[derive(Deserialize)]
struct RawHeader {
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    enc: Option<String>,
}

/// Registered claims are optional here; presence is enforced by
/// `Validation::set_required_spec_claims` so a missing one reports its name.
#[derive(Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    email: Option<String>,
}

impl CredentialVerifier {
    /// Create a verifier expecting `issuer` and `audience`, with 60 s leeway
    #[must_use]
    pub fn new(issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            leeway_secs: 60,
            api_key: None,
        }
    }

    /// Build from configuration
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        let mut verifier = Self::new(config.issuer(), config.audience.clone())
            .with_leeway(config.leeway.as_secs());
        if config.legacy_api_keys {
            verifier.api_key.clone_from(&config.api_key);
        }
        verifier
    }

    /// Override the clock-skew tolerance
    #[must_use]
    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.leeway_secs = secs;
        self
    }

    /// Provision a legacy API key for local comparison
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Whether a legacy API key is provisioned locally
    #[must_use]
    pub fn has_local_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Verify any credential variant
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] describing the first failed check.
    pub fn verify(&self, credential: &Credential, keys: &KeySet) -> Result<IdentityContext, AuthError> {
        match credential {
            Credential::Jwt(token) => self.verify_jwt(token, keys),
            Credential::ApiKey(key) => self.verify_api_key(key),
            Credential::Unrecognized => Err(AuthError::MalformedCredential(
                "unsupported authorization scheme".into(),
            )),
        }
    }

    /// Verify a compact JWT
    ///
    /// # Errors
    ///
    /// Returns the [`AuthError`] describing the first failed check.
    pub fn verify_jwt(&self, token: &str, keys: &KeySet) -> Result<IdentityContext, AuthError> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() == 5 {
            return Err(AuthError::UnsupportedAlgorithm(
                "encrypted tokens (JWE) are not accepted".into(),
            ));
        }
        if segments.len() != 3 || segments.iter().any(|s| s.is_empty()) {
            return Err(AuthError::MalformedCredential(
                "expected three non-empty segments".into(),
            ));
        }

        check_raw_header(segments[0])?;

        let header = jsonwebtoken::decode_header(token)?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::MalformedCredential("token header has no kid".into()))?;
        let key = keys
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKey(kid.clone()))?;

        if !key.algorithms.contains(&header.alg) {
            return Err(AuthError::UnsupportedAlgorithm(format!(
                "{:?} cannot be verified with key {kid}",
                header.alg
            )));
        }

        let validation = self.validation(header.alg);
        let claims = jsonwebtoken::decode::<Claims>(token, &key.key, &validation)?.claims;

        let now = Utc::now().timestamp();
        let leeway = i64::try_from(self.leeway_secs).unwrap_or(i64::MAX);
        if claims.iat.is_some_and(|iat| iat > now.saturating_add(leeway)) {
            return Err(AuthError::ClaimValidationFailed(ClaimViolation::IssuedInFuture));
        }

        let subject = claims
            .sub
            .ok_or_else(|| AuthError::ClaimValidationFailed(ClaimViolation::MissingClaim("sub".into())))?;

        Ok(IdentityContext {
            subject,
            scopes: collect_scopes(claims.scope.as_deref(), claims.permissions),
            expires_at: claims.exp.and_then(|exp| DateTime::from_timestamp(exp, 0)),
            issuer: claims.iss,
            email: claims.email,
            method: AuthMethod::Jwt,
        })
    }

    /// Compare a legacy API key against the provisioned one in constant time
    ///
    /// Both sides are hashed first so the comparison does not depend on
    /// where the first differing byte is, or on the key length.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidApiKey`] on mismatch or when no key is
    /// provisioned.
    pub fn verify_api_key(&self, key: &str) -> Result<IdentityContext, AuthError> {
        let Some(expected) = &self.api_key else {
            return Err(AuthError::InvalidApiKey);
        };

        let presented = Sha256::digest(key.as_bytes());
        let expected = Sha256::digest(expected.as_bytes());
        if bool::from(presented.as_slice().ct_eq(expected.as_slice())) {
            Ok(IdentityContext::api_key(key, AuthMethod::ApiKey))
        } else {
            Err(AuthError::InvalidApiKey)
        }
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut v = Validation::new(alg);
        v.leeway = self.leeway_secs;
        v.validate_exp = true;
        v.validate_nbf = true;
        v.set_issuer(&[&self.issuer]);
        v.set_audience(&[&self.audience]);
        v.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        v
    }
}

fn check_raw_header(segment: &str) -> Result<(), AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::MalformedCredential("header is not base64url".into()))?;
    let header: RawHeader = serde_json::from_slice(&bytes)
        .map_err(|_| AuthError::MalformedCredential("header is not JSON".into()))?;

    if header.enc.is_some() {
        return Err(AuthError::UnsupportedAlgorithm(
            "encrypted tokens (JWE) are not accepted".into(),
        ));
    }
    match header.alg.as_deref() {
        None => Err(AuthError::MalformedCredential("header has no alg".into())),
        Some(alg) if alg.eq_ignore_ascii_case("none") || alg == "dir" || alg.starts_with("HS") => {
            Err(AuthError::UnsupportedAlgorithm(alg.to_string()))
        }
        Some(_) => Ok(()),
    }
}

/// `scope` is space separated; `permissions` is the RBAC claim array
fn collect_scopes(scope: Option<&str>, permissions: Vec<String>) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    let from_scope = scope.into_iter().flat_map(str::split_whitespace).map(String::from);
    for s in from_scope.chain(permissions) {
        if !scopes.contains(&s) {
            scopes.push(s);
        }
    }
    scopes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwks::VerificationKey;
    use jsonwebtoken::{DecodingKey, EncodingKey, Header};
    use serde_json::json;

    const ISSUER: &str = "https://tenant.auth0.com/";
    const AUDIENCE: &str = "https://sandbox-api";

    struct Signer {
        encoding: EncodingKey,
        decoding: DecodingKey,
    }

    fn signer() -> Signer {
        let kp = rcgen::KeyPair::generate().unwrap();
        let encoding = EncodingKey::from_ec_pem(kp.serialize_pem().as_bytes()).unwrap();
        let raw = kp.public_key_raw();
        let x = URL_SAFE_NO_PAD.encode(&raw[1..33]);
        let y = URL_SAFE_NO_PAD.encode(&raw[33..65]);
        let decoding = DecodingKey::from_ec_components(&x, &y).unwrap();
        Signer { encoding, decoding }
    }

    fn key_set(kid: &str, s: &Signer) -> KeySet {
        KeySet::from_keys([VerificationKey {
            kid: kid.to_string(),
            key: s.decoding.clone(),
            algorithms: &[Algorithm::ES256],
        }])
    }

    fn claims(overrides: serde_json::Value) -> serde_json::Value {
        let now = Utc::now().timestamp();
        let mut base = json!({
            "sub": "auth0|user-1",
            "iss": ISSUER,
            "aud": AUDIENCE,
            "iat": now,
            "exp": now + 3600,
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                if v.is_null() {
                    base.remove(k);
                } else {
                    base.insert(k.clone(), v.clone());
                }
            }
        }
        base
    }

    fn sign(s: &Signer, kid: &str, claims: &serde_json::Value) -> String {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(kid.to_string());
        jsonwebtoken::encode(&header, claims, &s.encoding).unwrap()
    }

    fn verifier() -> CredentialVerifier {
        CredentialVerifier::new(ISSUER, AUDIENCE)
    }

    #[test]
    fn valid_token_yields_identity() {
        // GIVEN: a token signed by a trusted key with valid claims
        let s = signer();
        let token = sign(
            &s,
            "k1",
            &claims(json!({
                "scope": "read:sandboxes write:sandboxes",
                "permissions": ["read:sandboxes", "admin"],
                "email": "dev@example.com"
            })),
        );

        // WHEN: verifying
        let identity = verifier().verify_jwt(&token, &key_set("k1", &s)).unwrap();

        // THEN: identity reflects the payload
        assert_eq!(identity.subject, "auth0|user-1");
        assert_eq!(identity.issuer.as_deref(), Some(ISSUER));
        assert_eq!(identity.email.as_deref(), Some("dev@example.com"));
        assert_eq!(identity.method, AuthMethod::Jwt);
        assert_eq!(
            identity.scopes,
            vec!["read:sandboxes", "write:sandboxes", "admin"]
        );
        assert!(identity.expires_at.is_some_and(|t| t > Utc::now()));
    }

    #[test]
    fn audience_array_is_accepted() {
        let s = signer();
        let token = sign(
            &s,
            "k1",
            &claims(json!({"aud": ["https://other", AUDIENCE]})),
        );
        assert!(verifier().verify_jwt(&token, &key_set("k1", &s)).is_ok());
    }

    #[test]
    fn expired_token_is_claim_failure_not_signature_failure() {
        let s = signer();
        let past = Utc::now().timestamp() - 3600;
        let token = sign(&s, "k1", &claims(json!({"exp": past, "iat": past - 60})));

        let err = verifier().verify_jwt(&token, &key_set("k1", &s)).unwrap_err();
        assert_eq!(err, AuthError::ClaimValidationFailed(ClaimViolation::Expired));
    }

    #[test]
    fn expiry_within_leeway_is_tolerated() {
        let s = signer();
        let token = sign(
            &s,
            "k1",
            &claims(json!({"exp": Utc::now().timestamp() - 30})),
        );
        assert!(verifier().verify_jwt(&token, &key_set("k1", &s)).is_ok());
    }

    #[test]
    fn untrusted_key_is_invalid_signature() {
        // GIVEN: the token is signed by a key the provider never published,
        // but under a kid that the key set does contain
        let trusted = signer();
        let attacker = signer();
        let token = sign(&attacker, "k1", &claims(json!({})));

        let err = verifier()
            .verify_jwt(&token, &key_set("k1", &trusted))
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidSignature);
    }

    #[test]
    fn unknown_kid_is_reported() {
        let s = signer();
        let token = sign(&s, "rotated", &claims(json!({})));
        let err = verifier().verify_jwt(&token, &key_set("k1", &s)).unwrap_err();
        assert_eq!(err, AuthError::UnknownKey("rotated".into()));
    }

    #[test]
    fn wrong_issuer_and_audience() {
        let s = signer();
        let keys = key_set("k1", &s);

        let token = sign(&s, "k1", &claims(json!({"iss": "https://evil.example/"})));
        assert_eq!(
            verifier().verify_jwt(&token, &keys).unwrap_err(),
            AuthError::ClaimValidationFailed(ClaimViolation::IssuerMismatch)
        );

        let token = sign(&s, "k1", &claims(json!({"aud": "https://other-api"})));
        assert_eq!(
            verifier().verify_jwt(&token, &keys).unwrap_err(),
            AuthError::ClaimValidationFailed(ClaimViolation::AudienceMismatch)
        );
    }

    #[test]
    fn issued_in_future_is_rejected() {
        let s = signer();
        let future = Utc::now().timestamp() + 600;
        let token = sign(&s, "k1", &claims(json!({"iat": future, "exp": future + 3600})));
        assert_eq!(
            verifier().verify_jwt(&token, &key_set("k1", &s)).unwrap_err(),
            AuthError::ClaimValidationFailed(ClaimViolation::IssuedInFuture)
        );
    }

    #[test]
    fn not_before_in_future_is_rejected() {
        let s = signer();
        let token = sign(
            &s,
            "k1",
            &claims(json!({"nbf": Utc::now().timestamp() + 600})),
        );
        assert_eq!(
            verifier().verify_jwt(&token, &key_set("k1", &s)).unwrap_err(),
            AuthError::ClaimValidationFailed(ClaimViolation::NotYetValid)
        );
    }

    #[test]
    fn missing_subject_is_rejected() {
        let s = signer();
        let token = sign(&s, "k1", &claims(json!({"sub": null})));
        assert_eq!(
            verifier().verify_jwt(&token, &key_set("k1", &s)).unwrap_err(),
            AuthError::ClaimValidationFailed(ClaimViolation::MissingClaim("sub".into()))
        );
    }

    #[test]
    fn symmetric_tokens_are_refused() {
        let s = signer();
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some("k1".into());
        let token = jsonwebtoken::encode(
            &header,
            &claims(json!({})),
            &EncodingKey::from_secret(b"public-key-as-secret"),
        )
        .unwrap();

        assert!(matches!(
            verifier().verify_jwt(&token, &key_set("k1", &s)),
            Err(AuthError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn encrypted_and_unsigned_tokens_are_refused() {
        let keys = KeySet::default();
        let jwe = "eyJhbGciOiJkaXIiLCJlbmMiOiJBMjU2R0NNIn0..aXY.Y2lwaGVy.dGFn";
        assert!(matches!(
            verifier().verify_jwt(jwe, &keys),
            Err(AuthError::UnsupportedAlgorithm(_))
        ));

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","kid":"k1"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#);
        let unsigned = format!("{header}.{payload}.c2ln");
        assert!(matches!(
            verifier().verify_jwt(&unsigned, &keys),
            Err(AuthError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn malformed_tokens() {
        let keys = KeySet::default();
        for token in ["abc", "a.b", "a..c", "!!!.###.$$$"] {
            assert!(
                matches!(
                    verifier().verify_jwt(token, &keys),
                    Err(AuthError::MalformedCredential(_))
                ),
                "{token} should be malformed"
            );
        }

        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256"}"#);
        let token = format!("{header}.e30.c2ln");
        assert_eq!(
            verifier().verify_jwt(&token, &keys).unwrap_err(),
            AuthError::MalformedCredential("token header has no kid".into())
        );
    }

    #[test]
    fn api_key_exact_match_only() {
        let v = verifier().with_api_key("sk-live-0123456789");

        let identity = v.verify_api_key("sk-live-0123456789").unwrap();
        assert_eq!(identity.method, AuthMethod::ApiKey);
        assert!(identity.subject.starts_with("api-key:"));

        for wrong in ["", "sk-live-012345678", "sk-live-0123456789 ", "xk-live-0123456789"] {
            assert_eq!(v.verify_api_key(wrong).unwrap_err(), AuthError::InvalidApiKey);
        }
    }

    #[test]
    fn api_key_without_provisioned_key_is_rejected() {
        assert_eq!(
            verifier().verify_api_key("anything").unwrap_err(),
            AuthError::InvalidApiKey
        );
    }

    #[test]
    fn verify_dispatches_on_variant() {
        let v = verifier().with_api_key("k");
        let keys = KeySet::default();
        assert!(v.verify(&Credential::ApiKey("k".into()), &keys).is_ok());
        assert!(matches!(
            v.verify(&Credential::Unrecognized, &keys),
            Err(AuthError::MalformedCredential(_))
        ));
    }

    #[test]
    fn debug_redacts_api_key() {
        let v = verifier().with_api_key("sk-secret");
        assert!(!format!("{v:?}").contains("sk-secret"));
    }
}
