//! Validation of token claims
//!
//! Checks run in a fixed order: expiry, then issuer, then audience. The
//! first failing check determines the rejection.

use serde::Serialize;
use vouch_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{
    error,
    jwt::{Audience, AudienceRef, Audiences, Claims, Issuer, IssuerRef, SubjectRef},
};

/// The prefix of the issuer for tokens minted by Google's secure-token service
pub const DEFAULT_ISSUER_PREFIX: &str = "https://securetoken.google.com/";

/// A validator for the claims of tokens issued for one project
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct ClaimValidator {
    issuer: Issuer,
    audience: Audience,
    leeway: DurationSecs,
}

impl ClaimValidator {
    /// Constructs a validator expecting exactly `issuer` and `audience`
    pub fn new(issuer: impl Into<Issuer>, audience: impl Into<Audience>) -> Self {
        Self {
            issuer: issuer.into(),
            audience: audience.into(),
            leeway: DurationSecs(0),
        }
    }

    /// Constructs a validator for tokens issued by the secure-token service
    /// to `project_id`
    pub fn for_project(project_id: &str) -> Self {
        Self::new(format!("{DEFAULT_ISSUER_PREFIX}{project_id}"), project_id)
    }

    /// Allows a grace period after the `exp` claim
    #[inline]
    pub fn with_leeway(self, leeway: DurationSecs) -> Self {
        Self { leeway, ..self }
    }

    /// The expected issuer
    #[must_use]
    pub fn issuer(&self) -> &IssuerRef {
        &self.issuer
    }

    /// The expected audience
    #[must_use]
    pub fn audience(&self) -> &AudienceRef {
        &self.audience
    }

    /// Validates `claims` against the system clock
    ///
    /// # Errors
    ///
    /// See [`validate_with_clock`][Self::validate_with_clock].
    #[inline]
    pub fn validate(&self, claims: Claims) -> Result<ValidatedClaims, error::ClaimsRejected> {
        self.validate_with_clock(claims, &System)
    }

    /// Validates `claims` against the time told by `clock`
    ///
    /// # Errors
    ///
    /// * `TokenExpired` when `exp` is absent or earlier than now, less any
    ///   leeway
    /// * `IssuerMismatch` when `iss` is absent or not the expected issuer
    /// * `AudienceMismatch` when `aud` is absent or does not include the
    ///   expected audience
    pub fn validate_with_clock<C: Clock>(
        &self,
        claims: Claims,
        clock: &C,
    ) -> Result<ValidatedClaims, error::ClaimsRejected> {
        let now = clock.now();

        match claims.exp() {
            Some(exp) if exp.0 >= now.0.saturating_sub(self.leeway.0) => {}
            _ => return Err(error::ClaimsRejected::TokenExpired),
        }

        if claims.iss() != Some(&*self.issuer) {
            return Err(error::ClaimsRejected::IssuerMismatch);
        }

        if !claims.aud().contains(&self.audience) {
            return Err(error::ClaimsRejected::AudienceMismatch);
        }

        Ok(ValidatedClaims(claims))
    }
}

/// Claims from a token whose signature and claims have been checked
///
/// Serializes as the original payload.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ValidatedClaims(Claims);

impl ValidatedClaims {
    pub(crate) fn new_unchecked(claims: Claims) -> Self {
        Self(claims)
    }

    /// Expiration time
    #[must_use]
    pub fn exp(&self) -> UnixTime {
        self.0.exp().unwrap_or_default()
    }

    /// Issuer
    #[must_use]
    pub fn iss(&self) -> Option<&IssuerRef> {
        self.0.iss()
    }

    /// Audiences
    pub fn aud(&self) -> &Audiences {
        self.0.aud()
    }

    /// Subject
    #[must_use]
    pub fn sub(&self) -> Option<&SubjectRef> {
        self.0.sub()
    }

    /// The user the token was issued to
    ///
    /// Prefers the provider's `user_id` claim and falls back to `sub`.
    #[must_use]
    pub fn user_id(&self) -> Option<&SubjectRef> {
        self.0.user_id()
    }

    /// Any other claim, by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    /// The full claim set
    pub fn claims(&self) -> &Claims {
        &self.0
    }

    /// Unwraps the full claim set
    pub fn into_claims(self) -> Claims {
        self.0
    }
}
