//! Inbound authentication
//!
//! [`Authorizer`] is the single entry point tool calls go through. It parses
//! the caller's [`Credential`], verifies it with [`CredentialVerifier`]
//! against keys from the shared [`KeyMaterialCache`], and yields an
//! [`AuthenticatedCaller`].

mod authorizer;
mod credential;
mod error;
mod jwks;
mod verifier;

pub use authorizer::Authorizer;
pub use credential::{
    AuthMethod, AuthenticatedCaller, Credential, ForwardedCredential, IdentityContext,
    fingerprint,
};
pub use error::{AuthError, ClaimViolation, KeyFetchError};
pub use jwks::{HttpJwksFetcher, JwksFetcher, KeyMaterialCache, KeySet, VerificationKey};
pub use verifier::CredentialVerifier;
