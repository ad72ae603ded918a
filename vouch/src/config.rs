//! Verifier configuration
//!
//! The expected issuer and audience are both derived from a single project
//! identifier. A test bypass can be enabled, but only when the runtime is
//! explicitly marked as non-production *and* the bypass is explicitly
//! allowed. Either flag alone has no effect.

use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use vouch_clock::{DurationSecs, UnixTime};

use crate::{
    cache::{DEFAULT_FALLBACK_LIFETIME, DEFAULT_FETCH_TIMEOUT},
    claims::{ClaimValidator, ValidatedClaims, DEFAULT_ISSUER_PREFIX},
    error::ConfigError,
    jwt::{Claims, Issuer},
    keys::DEFAULT_KEY_SOURCE_URL,
};

/// Names the project whose tokens are accepted
pub const PROJECT_ID_VAR: &str = "VOUCH_PROJECT_ID";

/// Overrides the endpoint signing keys are fetched from
pub const KEY_SOURCE_URL_VAR: &str = "VOUCH_KEY_SOURCE_URL";

/// Names the runtime environment, `production` unless set otherwise
pub const ENVIRONMENT_VAR: &str = "VOUCH_ENVIRONMENT";

/// Allows the test bypass in a non-production environment
pub const ALLOW_TEST_BYPASS_VAR: &str = "VOUCH_ALLOW_TEST_BYPASS";

/// The subject of the claims produced by the test bypass
pub const TEST_BYPASS_SUBJECT: &str = "test-user";

const TEST_BYPASS_LIFETIME: DurationSecs = DurationSecs(3600);

/// The kind of environment the verifier runs in
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeEnvironment {
    /// A production deployment; the test bypass is never available
    #[default]
    Production,

    /// A development, test, or staging deployment
    NonProduction,
}

impl FromStr for RuntimeEnvironment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "non-production" | "development" | "dev" | "test" | "staging" | "local" => {
                Ok(Self::NonProduction)
            }
            _ => Err(ConfigError::InvalidValue {
                name: ENVIRONMENT_VAR,
                value: s.to_owned(),
            }),
        }
    }
}

/// Configuration for a [`TokenVerifier`][crate::TokenVerifier]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct VerifierConfig {
    project_id: String,
    #[serde(default = "default_issuer_prefix")]
    issuer_prefix: String,
    #[serde(default = "default_key_source_url")]
    key_source_url: String,
    #[serde(
        rename = "fetch_timeout_ms",
        default = "default_fetch_timeout",
        with = "millis"
    )]
    fetch_timeout: Duration,
    #[serde(default = "default_fallback_key_lifetime")]
    fallback_key_lifetime: DurationSecs,
    #[serde(default)]
    leeway: DurationSecs,
    #[serde(default)]
    environment: RuntimeEnvironment,
    #[serde(default)]
    allow_test_bypass: bool,
}

fn default_issuer_prefix() -> String {
    DEFAULT_ISSUER_PREFIX.to_owned()
}

fn default_key_source_url() -> String {
    DEFAULT_KEY_SOURCE_URL.to_owned()
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_fallback_key_lifetime() -> DurationSecs {
    DEFAULT_FALLBACK_LIFETIME
}

impl VerifierConfig {
    /// Constructs a production configuration for `project_id` with defaults
    /// for everything else
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            issuer_prefix: default_issuer_prefix(),
            key_source_url: default_key_source_url(),
            fetch_timeout: default_fetch_timeout(),
            fallback_key_lifetime: default_fallback_key_lifetime(),
            leeway: DurationSecs(0),
            environment: RuntimeEnvironment::Production,
            allow_test_bypass: false,
        }
    }

    /// Loads configuration from the process environment
    ///
    /// # Errors
    ///
    /// See [`from_lookup`][Self::from_lookup].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from variables resolved by `lookup`
    ///
    /// Reads [`PROJECT_ID_VAR`], [`KEY_SOURCE_URL_VAR`], [`ENVIRONMENT_VAR`],
    /// and [`ALLOW_TEST_BYPASS_VAR`]. Unset variables take their defaults.
    ///
    /// # Errors
    ///
    /// The project identifier is unset or blank, or a flag holds a value
    /// that cannot be interpreted.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_blank = |name| lookup(name).filter(|v: &String| !v.trim().is_empty());

        let project_id = non_blank(PROJECT_ID_VAR).ok_or(ConfigError::MissingProjectId)?;
        let mut config = Self::new(project_id.trim());

        if let Some(url) = non_blank(KEY_SOURCE_URL_VAR) {
            config.key_source_url = url.trim().to_owned();
        }

        if let Some(env) = non_blank(ENVIRONMENT_VAR) {
            config.environment = env.parse()?;
        }

        if let Some(flag) = non_blank(ALLOW_TEST_BYPASS_VAR) {
            config.allow_test_bypass = parse_flag(ALLOW_TEST_BYPASS_VAR, &flag)?;
        }

        Ok(config)
    }

    /// Sets the prefix the project identifier is appended to when forming
    /// the expected issuer
    pub fn with_issuer_prefix(self, issuer_prefix: impl Into<String>) -> Self {
        Self {
            issuer_prefix: issuer_prefix.into(),
            ..self
        }
    }

    /// Sets the endpoint signing keys are fetched from
    pub fn with_key_source_url(self, key_source_url: impl Into<String>) -> Self {
        Self {
            key_source_url: key_source_url.into(),
            ..self
        }
    }

    /// Bounds each key fetch
    pub fn with_fetch_timeout(self, fetch_timeout: Duration) -> Self {
        Self {
            fetch_timeout,
            ..self
        }
    }

    /// Sets how long keys are cached when the source does not say
    pub fn with_fallback_key_lifetime(self, fallback_key_lifetime: DurationSecs) -> Self {
        Self {
            fallback_key_lifetime,
            ..self
        }
    }

    /// Allows a grace period after token expiry
    pub fn with_leeway(self, leeway: DurationSecs) -> Self {
        Self { leeway, ..self }
    }

    /// Sets the runtime environment
    pub fn with_environment(self, environment: RuntimeEnvironment) -> Self {
        Self {
            environment,
            ..self
        }
    }

    /// Sets whether the test bypass is allowed
    ///
    /// Has no effect in a production environment.
    pub fn with_test_bypass_allowed(self, allow_test_bypass: bool) -> Self {
        Self {
            allow_test_bypass,
            ..self
        }
    }

    /// The project whose tokens are accepted
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// The endpoint signing keys are fetched from
    #[must_use]
    pub fn key_source_url(&self) -> &str {
        &self.key_source_url
    }

    /// The bound on each key fetch
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// How long keys are cached when the source does not say
    #[must_use]
    pub fn fallback_key_lifetime(&self) -> DurationSecs {
        self.fallback_key_lifetime
    }

    /// The runtime environment
    #[must_use]
    pub fn environment(&self) -> RuntimeEnvironment {
        self.environment
    }

    /// The issuer tokens must name
    pub fn expected_issuer(&self) -> Issuer {
        Issuer::new(format!("{}{}", self.issuer_prefix, self.project_id))
    }

    /// A validator for the issuer, audience, and leeway configured here
    pub fn claim_validator(&self) -> ClaimValidator {
        ClaimValidator::new(self.expected_issuer(), self.project_id.as_str())
            .with_leeway(self.leeway)
    }

    /// The test bypass, if and only if both of its flags are set
    #[must_use]
    pub fn test_bypass(&self) -> Option<TestBypass> {
        match (self.environment, self.allow_test_bypass) {
            (RuntimeEnvironment::NonProduction, true) => Some(TestBypass {
                issuer: self.expected_issuer(),
                project_id: self.project_id.clone(),
            }),
            _ => None,
        }
    }
}

/// Permission to accept tokens without verifying them
///
/// Only obtainable from [`VerifierConfig::test_bypass`], which requires a
/// non-production environment and an explicit allowance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestBypass {
    issuer: Issuer,
    project_id: String,
}

impl TestBypass {
    /// The fixed claims granted by the bypass, valid for an hour from `now`
    pub fn claims_at(&self, now: UnixTime) -> ValidatedClaims {
        let claims = Claims::new()
            .with_expiration(now + TEST_BYPASS_LIFETIME)
            .with_issuer(self.issuer.clone())
            .with_audience(self.project_id.as_str())
            .with_subject(TEST_BYPASS_SUBJECT);

        ValidatedClaims::new_unchecked(claims)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use color_eyre::Result;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_production_without_bypass() -> Result<()> {
        let config = VerifierConfig::from_lookup(lookup(&[(PROJECT_ID_VAR, "proj")]))?;

        assert_eq!(config.project_id(), "proj");
        assert_eq!(config.key_source_url(), DEFAULT_KEY_SOURCE_URL);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(10));
        assert_eq!(config.fallback_key_lifetime(), DurationSecs(300));
        assert_eq!(config.environment(), RuntimeEnvironment::Production);
        assert_eq!(
            config.expected_issuer().as_str(),
            "https://securetoken.google.com/proj"
        );
        assert!(config.test_bypass().is_none());
        Ok(())
    }

    #[test]
    fn project_id_is_required() {
        assert_eq!(
            VerifierConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingProjectId)
        );
        assert_eq!(
            VerifierConfig::from_lookup(lookup(&[(PROJECT_ID_VAR, "  ")])),
            Err(ConfigError::MissingProjectId)
        );
    }

    #[test]
    fn bypass_requires_both_flags() -> Result<()> {
        let cases = [
            (None, None, false),
            (Some("development"), None, false),
            (None, Some("true"), false),
            (Some("production"), Some("true"), false),
            (Some("development"), Some("false"), false),
            (Some("development"), Some("true"), true),
            (Some("TEST"), Some("1"), true),
        ];

        for (env, allow, expected) in cases {
            let mut vars = vec![(PROJECT_ID_VAR, "proj")];
            vars.extend(env.map(|v| (ENVIRONMENT_VAR, v)));
            vars.extend(allow.map(|v| (ALLOW_TEST_BYPASS_VAR, v)));

            let config = VerifierConfig::from_lookup(lookup(&vars))?;
            assert_eq!(
                config.test_bypass().is_some(),
                expected,
                "{env:?} {allow:?}"
            );
        }
        Ok(())
    }

    #[test]
    fn unrecognized_flags_are_errors() {
        let err = VerifierConfig::from_lookup(lookup(&[
            (PROJECT_ID_VAR, "proj"),
            (ALLOW_TEST_BYPASS_VAR, "maybe"),
        ]))
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: ALLOW_TEST_BYPASS_VAR,
                value: "maybe".to_owned(),
            }
        );

        let err = VerifierConfig::from_lookup(lookup(&[
            (PROJECT_ID_VAR, "proj"),
            (ENVIRONMENT_VAR, "moon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name, .. } if name == ENVIRONMENT_VAR));
    }

    #[test]
    fn bypass_claims_pass_the_configured_validator() {
        let config = VerifierConfig::new("proj")
            .with_environment(RuntimeEnvironment::NonProduction)
            .with_test_bypass_allowed(true);

        let now = UnixTime(1_700_000_000);
        let claims = config.test_bypass().unwrap().claims_at(now);

        assert_eq!(claims.user_id().map(|s| s.as_str()), Some(TEST_BYPASS_SUBJECT));
        assert_eq!(claims.exp(), UnixTime(now.0 + 3600));

        let revalidated = config
            .claim_validator()
            .validate_with_clock(claims.clone().into_claims(), &vouch_clock::TestClock::new(now));
        assert_eq!(revalidated, Ok(claims));
    }

    #[test]
    fn deserializes_with_defaults() -> Result<()> {
        let config: VerifierConfig = serde_json::from_value(serde_json::json!({
            "project_id": "proj",
            "fetch_timeout_ms": 3000,
            "environment": "non-production",
        }))?;

        assert_eq!(config.fetch_timeout(), Duration::from_secs(3));
        assert_eq!(config.environment(), RuntimeEnvironment::NonProduction);
        assert_eq!(config.key_source_url(), DEFAULT_KEY_SOURCE_URL);
        assert!(config.test_bypass().is_none());
        Ok(())
    }

    #[test]
    fn sub_second_fetch_timeout_is_kept() -> Result<()> {
        let config = VerifierConfig::new("proj").with_fetch_timeout(Duration::from_millis(900));
        assert_eq!(config.fetch_timeout(), Duration::from_millis(900));

        let json = serde_json::to_value(&config)?;
        assert_eq!(json["fetch_timeout_ms"], serde_json::json!(900));

        let restored: VerifierConfig = serde_json::from_value(json)?;
        assert_eq!(restored.fetch_timeout(), Duration::from_millis(900));
        Ok(())
    }

    #[test]
    fn custom_issuer_prefix_is_used() {
        let config = VerifierConfig::new("proj").with_issuer_prefix("https://issuer.example/");
        assert_eq!(config.expected_issuer().as_str(), "https://issuer.example/proj");
        assert_eq!(
            config.claim_validator().issuer().as_str(),
            "https://issuer.example/proj"
        );
    }
}
