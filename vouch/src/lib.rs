//! Verification of bearer ID tokens issued by Google's secure-token service
//!
//! Given the value of an `Authorization` header, a [`TokenVerifier`]
//! determines whether the bearer token it carries was signed by the identity
//! provider, has not expired, and was issued for the expected project. The
//! outcome is either a [`ValidatedClaims`] or a [`VerifyError`] naming the
//! first check that failed.
//!
//! Verification proceeds in a fixed sequence:
//!
//! 1. The token is extracted from `Bearer <token>`.
//! 2. It is split and its header and payload decoded ([`jwt`]).
//! 3. The signing key named by its `kid` is resolved from a [`KeyCache`],
//!    which fetches the provider's published keys only when its current
//!    set is missing or expired.
//! 4. The RS256 signature is checked over the original encoded bytes
//!    ([`jws`]).
//! 5. The `exp`, `iss`, and `aud` claims are validated ([`ClaimValidator`]).
//!
//! # Example
//!
//! ```no_run
//! use vouch::{TokenVerifier, VerifierConfig};
//!
//! # async fn handle(authorization: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = VerifierConfig::new("my-project");
//! let verifier = TokenVerifier::from_config(&config)?;
//!
//! let claims = verifier.verify_authorization(authorization).await?;
//! println!("caller: {:?}", claims.user_id());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod cache;
mod claims;
mod config;
pub mod error;
pub mod jws;
pub mod jwt;
pub mod keys;
mod verifier;

#[cfg(any(test, feature = "test-util"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;

pub use cache::{KeyCache, DEFAULT_FALLBACK_LIFETIME, DEFAULT_FETCH_TIMEOUT};
pub use claims::{ClaimValidator, ValidatedClaims, DEFAULT_ISSUER_PREFIX};
pub use config::{
    RuntimeEnvironment, TestBypass, VerifierConfig, ALLOW_TEST_BYPASS_VAR, ENVIRONMENT_VAR,
    KEY_SOURCE_URL_VAR, PROJECT_ID_VAR, TEST_BYPASS_SUBJECT,
};
pub use error::{RejectionKind, VerifyError};
pub use jwt::{Jwt, JwtRef};
pub use keys::{KeySource, SigningKeySet};
pub use verifier::{extract_bearer, TokenVerifier};
