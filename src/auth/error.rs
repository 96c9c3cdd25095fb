//! Authentication and key-fetch error types

use thiserror::Error;

/// Why a bearer credential was refused
///
/// The specific variant is logged; callers only ever see a uniform
/// "Unauthenticated" error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No `Authorization` header on a call that needs one
    #[error("Missing credential")]
    MissingCredential,

    /// Not a structurally valid token
    #[error("Malformed credential: {0}")]
    MalformedCredential(String),

    /// The token names a key id the key set does not contain
    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    /// Signature does not verify against the named key
    #[error("Invalid signature")]
    InvalidSignature,

    /// Signature is fine but a registered claim is not acceptable
    #[error("Claim validation failed: {0}")]
    ClaimValidationFailed(ClaimViolation),

    /// Encrypted or symmetric tokens, or an algorithm the key cannot verify
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Legacy API key did not match
    #[error("Invalid API key")]
    InvalidApiKey,
}

impl AuthError {
    /// Short stable label for structured logs
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingCredential => "missing_credential",
            Self::MalformedCredential(_) => "malformed_credential",
            Self::UnknownKey(_) => "unknown_key",
            Self::InvalidSignature => "invalid_signature",
            Self::ClaimValidationFailed(_) => "claim_validation_failed",
            Self::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            Self::InvalidApiKey => "invalid_api_key",
        }
    }
}

/// Which registered claim failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimViolation {
    /// `exp` is in the past beyond the allowed leeway
    #[error("token expired")]
    Expired,
    /// `nbf` is in the future beyond the allowed leeway
    #[error("token not yet valid")]
    NotYetValid,
    /// `iat` is in the future beyond the allowed leeway
    #[error("token issued in the future")]
    IssuedInFuture,
    /// `iss` differs from the configured issuer
    #[error("issuer mismatch")]
    IssuerMismatch,
    /// `aud` does not contain the configured audience
    #[error("audience mismatch")]
    AudienceMismatch,
    /// A required claim is absent
    #[error("missing claim '{0}'")]
    MissingClaim(String),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Utf8(_) => {
                Self::MalformedCredential("invalid token structure".into())
            }
            ErrorKind::Json(e) => Self::MalformedCredential(format!("invalid token JSON: {e}")),
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::ExpiredSignature => Self::ClaimValidationFailed(ClaimViolation::Expired),
            ErrorKind::ImmatureSignature => {
                Self::ClaimValidationFailed(ClaimViolation::NotYetValid)
            }
            ErrorKind::InvalidIssuer => {
                Self::ClaimValidationFailed(ClaimViolation::IssuerMismatch)
            }
            ErrorKind::InvalidAudience => {
                Self::ClaimValidationFailed(ClaimViolation::AudienceMismatch)
            }
            ErrorKind::MissingRequiredClaim(claim) => {
                Self::ClaimValidationFailed(ClaimViolation::MissingClaim(claim.clone()))
            }
            ErrorKind::InvalidAlgorithm
            | ErrorKind::MissingAlgorithm
            | ErrorKind::InvalidAlgorithmName => {
                Self::UnsupportedAlgorithm("algorithm does not match key".into())
            }
            _ => Self::InvalidSignature,
        }
    }
}

/// Failure fetching the identity provider's key set
///
/// `Clone` because every waiter on a shared refresh receives the same result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyFetchError {
    /// Transport failure or timeout
    #[error("JWKS request failed: {0}")]
    Request(String),

    /// The provider answered with a non-success status
    #[error("JWKS endpoint returned HTTP {0}")]
    Status(u16),

    /// The body was not a usable key set
    #[error("Invalid JWKS document: {0}")]
    InvalidKeySet(String),

    /// The refresh task panicked or was aborted
    #[error("JWKS refresh task failed: {0}")]
    TaskFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::errors::{Error as JwtError, ErrorKind};

    #[test]
    fn expired_maps_to_claim_violation_not_signature() {
        let err: AuthError = JwtError::from(ErrorKind::ExpiredSignature).into();
        assert_eq!(err, AuthError::ClaimValidationFailed(ClaimViolation::Expired));
    }

    #[test]
    fn signature_and_structure_errors() {
        let err: AuthError = JwtError::from(ErrorKind::InvalidSignature).into();
        assert_eq!(err, AuthError::InvalidSignature);

        let err: AuthError = JwtError::from(ErrorKind::InvalidToken).into();
        assert!(matches!(err, AuthError::MalformedCredential(_)));

        let err: AuthError = JwtError::from(ErrorKind::InvalidAlgorithm).into();
        assert!(matches!(err, AuthError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn missing_claim_carries_name() {
        let err: AuthError = JwtError::from(ErrorKind::MissingRequiredClaim("sub".into())).into();
        assert_eq!(err.to_string(), "Claim validation failed: missing claim 'sub'");
    }

    #[test]
    fn reason_labels() {
        assert_eq!(AuthError::MissingCredential.reason(), "missing_credential");
        assert_eq!(AuthError::UnknownKey("k1".into()).reason(), "unknown_key");
        assert_eq!(AuthError::InvalidApiKey.reason(), "invalid_api_key");
    }
}
