use vouch_clock::{Clock, System};

use crate::{
    cache::KeyCache,
    claims::{ClaimValidator, ValidatedClaims},
    config::{TestBypass, VerifierConfig},
    error::{self, VerifyError},
    jws,
    jwt::JwtRef,
    keys::KeySource,
};

const BEARER_PREFIX: &str = "Bearer ";

/// Verifies bearer tokens issued for one project
///
/// A verifier owns the key cache for its key source. Clones share that
/// cache, so a single verifier can be cloned into every request handler.
#[derive(Clone, Debug)]
#[must_use]
pub struct TokenVerifier<C = System> {
    keys: KeyCache<C>,
    validator: ClaimValidator,
    clock: C,
    bypass: Option<TestBypass>,
}

#[cfg(feature = "reqwest")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
impl TokenVerifier<System> {
    /// Constructs a verifier that fetches keys from the configured endpoint
    ///
    /// # Errors
    ///
    /// The HTTP client could not be constructed.
    pub fn from_config(config: &VerifierConfig) -> Result<Self, error::KeySourceUnavailable> {
        let source =
            crate::keys::RemoteKeySource::new(config.key_source_url(), config.fetch_timeout())?;
        Ok(Self::new(config, source, System))
    }
}

impl<C> TokenVerifier<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs a verifier over `source` that tells time with `clock`
    pub fn new(config: &VerifierConfig, source: impl KeySource, clock: C) -> Self {
        let keys = KeyCache::with_settings(
            source,
            clock.clone(),
            config.fallback_key_lifetime(),
            config.fetch_timeout(),
        );

        Self::with_cache(config, keys, clock)
    }

    /// Constructs a verifier around an existing key cache
    pub fn with_cache(config: &VerifierConfig, keys: KeyCache<C>, clock: C) -> Self {
        let bypass = config.test_bypass();
        if bypass.is_some() {
            tracing::warn!(
                project_id = config.project_id(),
                "test bypass enabled; bearer tokens will not be verified"
            );
        }

        Self {
            keys,
            validator: config.claim_validator(),
            clock,
            bypass,
        }
    }

    /// The key cache backing this verifier
    pub fn key_cache(&self) -> &KeyCache<C> {
        &self.keys
    }

    /// The claim validator applied to every token
    pub fn validator(&self) -> &ClaimValidator {
        &self.validator
    }

    /// Verifies the bearer token carried in an `Authorization` header value
    ///
    /// # Errors
    ///
    /// `MissingToken` when the header is absent or not of the form
    /// `Bearer <token>`; otherwise as for [`verify_token`][Self::verify_token].
    pub async fn verify_authorization(
        &self,
        authorization: Option<&str>,
    ) -> Result<ValidatedClaims, VerifyError> {
        match authorization.and_then(extract_bearer) {
            Some(token) => self.verify_token(token).await,
            None => {
                let err = VerifyError::from(error::missing_token());
                tracing::debug!(kind = %err.kind(), "token rejected");
                Err(err)
            }
        }
    }

    /// Verifies a token already extracted from its header
    ///
    /// Decodes the token, resolves its signing key, checks the signature,
    /// then validates its claims, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// The first check the token failed. A `KeySourceUnavailable` error is
    /// not retried.
    #[tracing::instrument(level = "debug", skip_all, fields(kid = tracing::field::Empty))]
    pub async fn verify_token(&self, token: &JwtRef) -> Result<ValidatedClaims, VerifyError> {
        if let Some(bypass) = &self.bypass {
            if !token.as_str().is_empty() {
                tracing::debug!("token accepted by test bypass");
                return Ok(bypass.claims_at(self.clock.now()));
            }
        }

        let result = self.check(token).await;

        match &result {
            Ok(claims) => {
                tracing::trace!(user_id = ?claims.user_id(), "token accepted");
            }
            Err(err) => {
                let error: &(dyn std::error::Error + 'static) = err;
                tracing::debug!(kind = %err.kind(), error, "token rejected");
            }
        }

        result
    }

    async fn check(&self, token: &JwtRef) -> Result<ValidatedClaims, VerifyError> {
        let decoded = token.decode()?;

        let kid = decoded
            .untrusted_header()
            .kid()
            .ok_or_else(|| error::unknown_signing_key(None))?;
        tracing::Span::current().record("kid", kid.as_str());

        let key = self.keys.get_key(kid).await?;

        if !jws::verify_signature(&decoded, &key) {
            return Err(error::invalid_signature().into());
        }

        let claims = self
            .validator
            .validate_with_clock(decoded.into_claims(), &self.clock)?;

        Ok(claims)
    }
}

/// Extracts the token from an `Authorization` header value
///
/// The value must be exactly `Bearer ` followed by a non-empty token
/// containing no whitespace. The scheme is matched case-sensitively.
#[must_use]
pub fn extract_bearer(authorization: &str) -> Option<&JwtRef> {
    let token = authorization.strip_prefix(BEARER_PREFIX)?;

    if token.is_empty() || token.contains(char::is_whitespace) {
        None
    } else {
        Some(JwtRef::from_str(token))
    }
}
