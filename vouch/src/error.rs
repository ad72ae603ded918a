//! Errors raised while verifying a bearer token
//!
//! Each failure is a distinct kind so callers can log the cause of a
//! rejection separately from the outcome. All kinds are terminal for the
//! call that produced them; retrying is the caller's decision.

#![allow(missing_copy_implementations)]

use std::{error::Error as StdError, fmt, sync::Arc};

use thiserror::Error;

use crate::keys::KeyId;

/// The `Authorization` header was absent or not of the form `Bearer <token>`
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Error)]
#[error("missing bearer token")]
pub struct MissingToken {
    _p: (),
}

pub(crate) const fn missing_token() -> MissingToken {
    MissingToken { _p: () }
}

/// The token could not be split into a header, payload, and signature, or
/// the header or payload were not base64url-encoded JSON
#[derive(Debug, Error)]
#[error("malformed token: {section}")]
pub struct MalformedToken {
    section: &'static str,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
}

impl MalformedToken {
    /// The section of the token that could not be parsed
    #[must_use]
    pub fn section(&self) -> &'static str {
        self.section
    }
}

pub(crate) fn malformed_token() -> MalformedToken {
    MalformedToken {
        section: "expected three segments",
        source: None,
    }
}

pub(crate) fn malformed_header(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> MalformedToken {
    MalformedToken {
        section: "header",
        source: Some(source.into()),
    }
}

pub(crate) fn malformed_payload(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> MalformedToken {
    MalformedToken {
        section: "payload",
        source: Some(source.into()),
    }
}

/// The token names a signing key that the identity provider does not publish
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub struct UnknownSigningKey {
    kid: Option<KeyId>,
}

impl fmt::Display for UnknownSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kid {
            Some(kid) => write!(f, "no signing key with kid '{kid}'"),
            None => f.write_str("token header does not name a signing key"),
        }
    }
}

impl UnknownSigningKey {
    /// The key identifier named by the token, if any
    #[must_use]
    pub fn kid(&self) -> Option<&KeyId> {
        self.kid.as_ref()
    }
}

pub(crate) fn unknown_signing_key(kid: Option<KeyId>) -> UnknownSigningKey {
    UnknownSigningKey { kid }
}

/// The signing key set could not be retrieved
///
/// This error is cheap to clone so that every caller waiting on a single
/// shared refresh observes the same failure.
#[derive(Clone, Debug, Error)]
#[error("signing key source unavailable: {reason}")]
pub struct KeySourceUnavailable {
    reason: &'static str,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl KeySourceUnavailable {
    /// A short description of why the key source was unavailable
    #[must_use]
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

pub(crate) fn key_source_unavailable(
    reason: &'static str,
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> KeySourceUnavailable {
    KeySourceUnavailable {
        reason,
        source: Some(Arc::from(source.into())),
    }
}

pub(crate) const fn key_source_timed_out() -> KeySourceUnavailable {
    KeySourceUnavailable {
        reason: "timed out",
        source: None,
    }
}

/// The signature did not match, or the token was not signed with the
/// trusted algorithm
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Error)]
#[error("invalid signature")]
pub struct InvalidSignature {
    _p: (),
}

pub(crate) const fn invalid_signature() -> InvalidSignature {
    InvalidSignature { _p: () }
}

/// A public key could not be loaded from its PEM encoding
#[derive(Debug, Error)]
#[error("key rejected")]
pub struct KeyRejected {
    #[from]
    source: Box<dyn StdError + Send + Sync + 'static>,
}

pub(crate) fn key_rejected(
    source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
) -> KeyRejected {
    KeyRejected {
        source: source.into(),
    }
}

/// An error occurring while resolving a signing key from the cache
#[derive(Clone, Debug, Error)]
pub enum KeyLookupError {
    /// No key with the requested identifier is published
    #[error(transparent)]
    UnknownSigningKey(#[from] UnknownSigningKey),

    /// The key set could not be refreshed
    #[error(transparent)]
    KeySourceUnavailable(#[from] KeySourceUnavailable),
}

impl From<KeyLookupError> for VerifyError {
    fn from(err: KeyLookupError) -> Self {
        match err {
            KeyLookupError::UnknownSigningKey(e) => Self::UnknownSigningKey(e),
            KeyLookupError::KeySourceUnavailable(e) => Self::KeySourceUnavailable(e),
        }
    }
}

/// The verifier configuration could not be loaded
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// No project identifier was provided
    #[error("project identifier is required")]
    MissingProjectId,

    /// A setting held a value that could not be interpreted
    #[error("invalid value '{value}' for {name}")]
    InvalidValue {
        /// The name of the setting
        name: &'static str,
        /// The value that was rejected
        value: String,
    },
}

/// An error occurring when validating the claims of a token
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Error)]
pub enum ClaimsRejected {
    /// The `exp` claim is absent or in the past
    #[error("token expired")]
    TokenExpired,

    /// The `iss` claim is absent or names a different issuer
    #[error("issuer mismatch")]
    IssuerMismatch,

    /// The `aud` claim is absent or names a different project
    #[error("audience mismatch")]
    AudienceMismatch,
}

/// An error occurring while verifying a bearer token
#[derive(Debug, Error)]
pub enum VerifyError {
    /// No bearer token was presented
    #[error(transparent)]
    MissingToken(#[from] MissingToken),

    /// The token is not a well-formed compact signed token
    #[error(transparent)]
    MalformedToken(#[from] MalformedToken),

    /// The token's signing key is not in the provider's key set
    #[error(transparent)]
    UnknownSigningKey(#[from] UnknownSigningKey),

    /// The provider's key set could not be fetched
    #[error(transparent)]
    KeySourceUnavailable(#[from] KeySourceUnavailable),

    /// The token's signature is invalid
    #[error(transparent)]
    InvalidSignature(#[from] InvalidSignature),

    /// The token's claims were rejected
    #[error(transparent)]
    ClaimsRejected(#[from] ClaimsRejected),
}

impl VerifyError {
    /// The kind of rejection, suitable for metrics or log fields
    #[must_use]
    pub fn kind(&self) -> RejectionKind {
        match self {
            Self::MissingToken(_) => RejectionKind::MissingToken,
            Self::MalformedToken(_) => RejectionKind::MalformedToken,
            Self::UnknownSigningKey(_) => RejectionKind::UnknownSigningKey,
            Self::KeySourceUnavailable(_) => RejectionKind::KeySourceUnavailable,
            Self::InvalidSignature(_) => RejectionKind::InvalidSignature,
            Self::ClaimsRejected(ClaimsRejected::TokenExpired) => RejectionKind::TokenExpired,
            Self::ClaimsRejected(ClaimsRejected::IssuerMismatch) => RejectionKind::IssuerMismatch,
            Self::ClaimsRejected(ClaimsRejected::AudienceMismatch) => {
                RejectionKind::AudienceMismatch
            }
        }
    }

    /// Whether the error is due to a missing bearer token
    #[must_use]
    pub fn is_missing_token(&self) -> bool {
        matches!(self, Self::MissingToken(_))
    }

    /// Whether the error is due to a malformed token
    #[must_use]
    pub fn is_malformed_token(&self) -> bool {
        matches!(self, Self::MalformedToken(_))
    }

    /// Whether the error is due to an unknown signing key
    #[must_use]
    pub fn is_unknown_signing_key(&self) -> bool {
        matches!(self, Self::UnknownSigningKey(_))
    }

    /// Whether the error is due to the key source being unavailable
    #[must_use]
    pub fn is_key_source_unavailable(&self) -> bool {
        matches!(self, Self::KeySourceUnavailable(_))
    }

    /// Whether the error is due to an invalid signature
    #[must_use]
    pub fn is_invalid_signature(&self) -> bool {
        matches!(self, Self::InvalidSignature(_))
    }
}

/// A copyable tag naming why a token was rejected
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum RejectionKind {
    /// See [`MissingToken`]
    MissingToken,
    /// See [`MalformedToken`]
    MalformedToken,
    /// See [`UnknownSigningKey`]
    UnknownSigningKey,
    /// See [`KeySourceUnavailable`]
    KeySourceUnavailable,
    /// See [`InvalidSignature`]
    InvalidSignature,
    /// See [`ClaimsRejected::TokenExpired`]
    TokenExpired,
    /// See [`ClaimsRejected::IssuerMismatch`]
    IssuerMismatch,
    /// See [`ClaimsRejected::AudienceMismatch`]
    AudienceMismatch,
}

impl RejectionKind {
    /// A stable, machine-friendly name for the rejection kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::MalformedToken => "malformed_token",
            Self::UnknownSigningKey => "unknown_signing_key",
            Self::KeySourceUnavailable => "key_source_unavailable",
            Self::InvalidSignature => "invalid_signature",
            Self::TokenExpired => "token_expired",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::AudienceMismatch => "audience_mismatch",
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
