//! Signature verification
//!
//! Only RSASSA-PKCS1-v1_5 with SHA-256 (`RS256`) is trusted. The algorithm
//! named in a token header is checked against that policy and is never used
//! to choose how the signature is verified.

use std::error::Error as StdError;

use base64::Engine;

use crate::jwt::{DecodedToken, BASE64_URL};

/// The only signing algorithm accepted
pub const TRUSTED_ALGORITHM: &str = "RS256";

/// A signature verifier for the trusted algorithm
pub trait Verifier {
    /// The error returned on a failure to verify
    type Error: StdError + Send + Sync + 'static;

    /// Attempts to verify the data against the signature
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), Self::Error>;
}

impl<T: Verifier + ?Sized> Verifier for &'_ T {
    type Error = T::Error;

    #[inline]
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), Self::Error> {
        T::verify(self, data, signature)
    }
}

/// Checks that a token was signed with the trusted algorithm by `key`
///
/// The signature covers the encoded header and payload exactly as they
/// appear in the token. A header naming any other algorithm, a signature
/// that is not base64url, and a signature that does not match all produce
/// `false`.
pub fn verify_signature<V: Verifier>(token: &DecodedToken<'_>, key: &V) -> bool {
    let alg = token.untrusted_header().alg();
    if alg != TRUSTED_ALGORITHM {
        tracing::debug!(alg, "token not signed with the trusted algorithm");
        return false;
    }

    let signature = match BASE64_URL.decode(token.signature()) {
        Ok(s) => s,
        Err(err) => {
            let error: &(dyn StdError + 'static) = &err;
            tracing::debug!(error, "token signature is not base64url");
            return false;
        }
    };

    match key.verify(token.message().as_bytes(), &signature) {
        Ok(()) => true,
        Err(err) => {
            let error: &(dyn StdError + 'static) = &err;
            tracing::debug!(error, "token signature did not match");
            false
        }
    }
}
