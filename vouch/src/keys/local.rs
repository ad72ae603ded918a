use async_trait::async_trait;
use vouch_clock::DurationSecs;

use super::{FetchedKeys, KeySource, SigningKeySet};
use crate::error;

/// A key source serving a fixed signing key set
///
/// Useful where the provider's keys are distributed out of band, and in
/// tests.
#[derive(Clone, Debug, Default)]
pub struct StaticKeySource {
    keys: SigningKeySet,
    max_age: Option<DurationSecs>,
}

impl StaticKeySource {
    /// Constructs a key source that always returns `keys`
    ///
    /// No cache lifetime is advertised, so the cache applies its fallback.
    pub fn new(keys: SigningKeySet) -> Self {
        Self {
            keys,
            max_age: None,
        }
    }

    /// Advertises a cache lifetime alongside the keys
    #[must_use]
    pub fn with_max_age(self, max_age: DurationSecs) -> Self {
        Self {
            max_age: Some(max_age),
            ..self
        }
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch(&self) -> Result<FetchedKeys, error::KeySourceUnavailable> {
        Ok(FetchedKeys {
            keys: self.keys.clone(),
            max_age: self.max_age,
        })
    }
}
