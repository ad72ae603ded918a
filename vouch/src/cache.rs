//! Caching of the provider's signing keys
//!
//! The cache holds at most one current key set. Readers load it without
//! locking; a refresh builds a complete replacement and swaps it in whole.
//!
//! Refreshes are coalesced. The first caller to find the cache cold or
//! expired starts a fetch and parks it in a shared slot; every caller that
//! arrives while it is running awaits that same fetch and observes the same
//! outcome, whether keys or an error.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use arc_swap::ArcSwapOption;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use vouch_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{
    error,
    keys::{KeyIdRef, KeySource, PublicKey, SigningKeySet},
};

/// The lifetime given to a key set when the source does not advertise one
pub const DEFAULT_FALLBACK_LIFETIME: DurationSecs = DurationSecs(300);

/// The longest a single fetch from the key source may take
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct CacheEntry {
    keys: SigningKeySet,
    expires_at: UnixTime,
}

type Refresh = Shared<BoxFuture<'static, Result<Arc<CacheEntry>, error::KeySourceUnavailable>>>;

struct Inner<C> {
    source: Arc<dyn KeySource>,
    clock: C,
    fallback_lifetime: DurationSecs,
    fetch_timeout: Duration,
    current: ArcSwapOption<CacheEntry>,
    in_flight: Mutex<Option<Refresh>>,
}

/// A shared, self-refreshing cache of signing keys
///
/// Cloning the cache is cheap; clones share the same key set and the same
/// in-flight refresh.
#[must_use]
pub struct KeyCache<C = System> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for KeyCache<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for KeyCache<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let current = self.inner.current.load_full();
        f.debug_struct("KeyCache")
            .field("source", &self.inner.source)
            .field("keys", &current.as_ref().map(|e| e.keys.len()))
            .field("expires_at", &current.as_ref().map(|e| e.expires_at))
            .finish_non_exhaustive()
    }
}

impl KeyCache<System> {
    /// Constructs an empty cache over `source`, using the system clock and
    /// default lifetimes
    pub fn new(source: impl KeySource) -> Self {
        Self::with_clock(source, System)
    }
}

impl<C> KeyCache<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs an empty cache over `source` that tells time with `clock`
    pub fn with_clock(source: impl KeySource, clock: C) -> Self {
        Self::with_settings(
            source,
            clock,
            DEFAULT_FALLBACK_LIFETIME,
            DEFAULT_FETCH_TIMEOUT,
        )
    }

    /// Constructs an empty cache with explicit lifetimes
    ///
    /// `fallback_lifetime` applies when the source does not say how long
    /// its keys may be cached. `fetch_timeout` bounds each fetch.
    pub fn with_settings(
        source: impl KeySource,
        clock: C,
        fallback_lifetime: DurationSecs,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source: Arc::new(source),
                clock,
                fallback_lifetime,
                fetch_timeout,
                current: ArcSwapOption::empty(),
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Resolves the key named `kid`
    ///
    /// Keys are served from the current key set while it is fresh. A key
    /// missing from a fresh set is reported as unknown without contacting
    /// the source. A cold or expired cache is refreshed first.
    ///
    /// # Errors
    ///
    /// The key is not in the current key set, or the key set had to be
    /// refreshed and the source was unavailable.
    pub async fn get_key(&self, kid: &KeyIdRef) -> Result<PublicKey, error::KeyLookupError> {
        let entry = self.current_entry().await?;

        match entry.keys.get(kid) {
            Some(key) => {
                tracing::trace!(%kid, "resolved signing key");
                Ok(key.clone())
            }
            None => Err(error::unknown_signing_key(Some(kid.to_owned())).into()),
        }
    }

    /// Ensures a fresh key set is loaded, fetching one if needed
    ///
    /// # Errors
    ///
    /// The cache needed a refresh and the source was unavailable.
    pub async fn prime(&self) -> Result<(), error::KeySourceUnavailable> {
        self.current_entry().await.map(|_| ())
    }

    /// When the current key set expires, if one has been loaded
    #[must_use]
    pub fn expires_at(&self) -> Option<UnixTime> {
        self.inner.current.load_full().map(|e| e.expires_at)
    }

    async fn current_entry(&self) -> Result<Arc<CacheEntry>, error::KeySourceUnavailable> {
        if let Some(entry) = self.inner.fresh_entry() {
            return Ok(entry);
        }

        let refresh = {
            let mut slot = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            // Another caller may have finished a refresh while we waited
            if let Some(entry) = self.inner.fresh_entry() {
                return Ok(entry);
            }

            match &*slot {
                Some(refresh) => refresh.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let refresh = inner.refresh().boxed().shared();
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await
    }
}

impl<C> Inner<C>
where
    C: Clock + Send + Sync + 'static,
{
    fn fresh_entry(&self) -> Option<Arc<CacheEntry>> {
        let entry = self.current.load_full()?;
        (self.clock.now() < entry.expires_at).then_some(entry)
    }

    async fn refresh(self: Arc<Self>) -> Result<Arc<CacheEntry>, error::KeySourceUnavailable> {
        let result = self.fetch().await;
        *self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        result
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn fetch(&self) -> Result<Arc<CacheEntry>, error::KeySourceUnavailable> {
        let fetched = match tokio::time::timeout(self.fetch_timeout, self.source.fetch()).await {
            Ok(Ok(fetched)) => fetched,
            Ok(Err(err)) => {
                let error: &(dyn std::error::Error + 'static) = &err;
                tracing::warn!(error, "signing key refresh failed");
                return Err(err);
            }
            Err(_) => {
                let err = error::key_source_timed_out();
                let error: &(dyn std::error::Error + 'static) = &err;
                tracing::warn!(
                    error,
                    timeout_ms = self.fetch_timeout.as_millis() as u64,
                    "signing key refresh failed",
                );
                return Err(err);
            }
        };

        let lifetime = fetched.max_age.unwrap_or(self.fallback_lifetime);
        let entry = Arc::new(CacheEntry {
            keys: fetched.keys,
            expires_at: self.clock.now() + lifetime,
        });

        self.current.store(Some(Arc::clone(&entry)));

        tracing::info!(
            keys = entry.keys.len(),
            %lifetime,
            expires_at = entry.expires_at.0,
            "signing keys refreshed"
        );

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use color_eyre::Result;
    use tracing_test::traced_test;
    use vouch_clock::TestClock;

    use super::*;
    use crate::keys::{FetchedKeys, KeyId};

    #[derive(Debug, Default)]
    struct ScriptedSource {
        keys: Mutex<Option<SigningKeySet>>,
        max_age: Option<DurationSecs>,
        delay: Duration,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn serving(kids: &[&str]) -> Self {
            Self {
                keys: Mutex::new(Some(key_set(kids))),
                ..Self::default()
            }
        }

        fn failing() -> Self {
            Self::default()
        }

        fn with_max_age(self, max_age: u64) -> Self {
            Self {
                max_age: Some(DurationSecs(max_age)),
                ..self
            }
        }

        fn with_delay(self, delay: Duration) -> Self {
            Self { delay, ..self }
        }

        fn set_keys(&self, keys: Option<SigningKeySet>) {
            *self.keys.lock().unwrap() = keys;
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KeySource for ScriptedSource {
        async fn fetch(&self) -> Result<FetchedKeys, error::KeySourceUnavailable> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;

            let keys = self.keys.lock().unwrap().clone();
            match keys {
                Some(keys) => Ok(FetchedKeys {
                    keys,
                    max_age: self.max_age,
                }),
                None => Err(error::key_source_unavailable(
                    "unexpected response status",
                    "503 Service Unavailable",
                )),
            }
        }
    }

    fn key_set(kids: &[&str]) -> SigningKeySet {
        kids.iter()
            .enumerate()
            .map(|(i, kid)| {
                let key = PublicKey::from_components(vec![0xC0 | i as u8; 256], vec![1, 0, 1])
                    .unwrap();
                (KeyId::from(*kid), key)
            })
            .collect()
    }

    fn kid(s: &str) -> &KeyIdRef {
        KeyIdRef::from_str(s)
    }

    fn cache(source: &Arc<ScriptedSource>, clock: &TestClock) -> KeyCache<TestClock> {
        KeyCache::with_settings(
            Arc::clone(source),
            clock.clone(),
            DurationSecs(300),
            Duration::from_millis(250),
        )
    }

    #[tokio::test]
    async fn serves_from_cache_until_expiry() -> Result<()> {
        let source = Arc::new(ScriptedSource::serving(&["a"]).with_max_age(60));
        let clock = TestClock::new(UnixTime(1_000));
        let cache = cache(&source, &clock);

        cache.get_key(kid("a")).await?;
        assert_eq!(source.fetches(), 1);
        assert_eq!(cache.expires_at(), Some(UnixTime(1_060)));

        clock.advance(DurationSecs(59));
        cache.get_key(kid("a")).await?;
        assert_eq!(source.fetches(), 1);

        clock.advance(DurationSecs(1));
        cache.get_key(kid("a")).await?;
        assert_eq!(source.fetches(), 2);
        assert_eq!(cache.expires_at(), Some(UnixTime(1_120)));
        Ok(())
    }

    #[tokio::test]
    async fn falls_back_when_no_lifetime_is_advertised() -> Result<()> {
        let source = Arc::new(ScriptedSource::serving(&["a"]));
        let clock = TestClock::new(UnixTime(1_000));
        let cache = cache(&source, &clock);

        cache.prime().await?;
        assert_eq!(cache.expires_at(), Some(UnixTime(1_300)));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_kid_on_fresh_cache_does_not_refetch() -> Result<()> {
        let source = Arc::new(ScriptedSource::serving(&["a"]).with_max_age(60));
        let clock = TestClock::new(UnixTime(1_000));
        let cache = cache(&source, &clock);

        let err = cache.get_key(kid("zzz")).await.unwrap_err();
        assert!(matches!(
            err,
            error::KeyLookupError::UnknownSigningKey(ref e) if e.kid().map(|k| k.as_str()) == Some("zzz")
        ));
        assert_eq!(source.fetches(), 1);

        for _ in 0..5 {
            assert!(cache.get_key(kid("zzz")).await.is_err());
        }
        assert_eq!(source.fetches(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn rotated_keys_are_picked_up_after_expiry() -> Result<()> {
        let source = Arc::new(ScriptedSource::serving(&["old"]).with_max_age(60));
        let clock = TestClock::new(UnixTime(1_000));
        let cache = cache(&source, &clock);

        cache.get_key(kid("old")).await?;
        source.set_keys(Some(key_set(&["new"])));

        assert!(cache.get_key(kid("new")).await.is_err());

        clock.advance(DurationSecs(60));
        cache.get_key(kid("new")).await?;
        assert!(cache.get_key(kid("old")).await.is_err());
        assert_eq!(source.fetches(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() -> Result<()> {
        let source = Arc::new(
            ScriptedSource::serving(&["a"])
                .with_max_age(60)
                .with_delay(Duration::from_millis(50)),
        );
        let clock = TestClock::new(UnixTime(1_000));
        let cache = cache(&source, &clock);

        let results =
            futures::future::join_all((0..16).map(|_| cache.get_key(kid("a")))).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(source.fetches(), 1);

        clock.advance(DurationSecs(60));
        let results =
            futures::future::join_all((0..16).map(|_| cache.get_key(kid("a")))).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(source.fetches(), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tasks_share_one_fetch() -> Result<()> {
        let source = Arc::new(
            ScriptedSource::serving(&["a"])
                .with_max_age(60)
                .with_delay(Duration::from_millis(100)),
        );
        let clock = TestClock::new(UnixTime(1_000));
        let cache = cache(&source, &clock);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_key(kid("a")).await.map(|_| ()) })
            })
            .collect();

        for task in tasks {
            task.await??;
        }
        assert_eq!(source.fetches(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn concurrent_callers_share_one_failure() {
        let source = Arc::new(ScriptedSource::failing().with_delay(Duration::from_millis(50)));
        let clock = TestClock::new(UnixTime(1_000));
        let cache = cache(&source, &clock);

        let results =
            futures::future::join_all((0..8).map(|_| cache.get_key(kid("a")))).await;
        for result in results {
            match result {
                Err(error::KeyLookupError::KeySourceUnavailable(e)) => {
                    assert_eq!(e.reason(), "unexpected response status");
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }
        assert_eq!(source.fetches(), 1);
        assert!(logs_contain("signing key refresh failed"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_entry_and_retries() -> Result<()> {
        let source = Arc::new(ScriptedSource::serving(&["a"]).with_max_age(60));
        let clock = TestClock::new(UnixTime(1_000));
        let cache = cache(&source, &clock);

        cache.prime().await?;
        source.set_keys(None);
        clock.advance(DurationSecs(120));

        let err = cache.get_key(kid("a")).await.unwrap_err();
        assert!(matches!(err, error::KeyLookupError::KeySourceUnavailable(_)));
        assert_eq!(cache.expires_at(), Some(UnixTime(1_060)));

        source.set_keys(Some(key_set(&["a"])));
        cache.get_key(kid("a")).await?;
        assert_eq!(source.fetches(), 3);
        assert_eq!(cache.expires_at(), Some(UnixTime(1_180)));
        Ok(())
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let source = Arc::new(ScriptedSource::serving(&["a"]).with_delay(Duration::from_secs(5)));
        let clock = TestClock::new(UnixTime(1_000));
        let cache = cache(&source, &clock);

        let started = std::time::Instant::now();
        let err = cache.prime().await.unwrap_err();

        assert_eq!(err.reason(), "timed out");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(cache.expires_at(), None);
    }

    #[tokio::test]
    async fn abandoned_refresh_is_resumed_by_the_next_caller() -> Result<()> {
        let source = Arc::new(
            ScriptedSource::serving(&["a"])
                .with_max_age(60)
                .with_delay(Duration::from_millis(50)),
        );
        let clock = TestClock::new(UnixTime(1_000));
        let cache = cache(&source, &clock);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(5), cache.get_key(kid("a"))).await;
        assert!(abandoned.is_err());

        cache.get_key(kid("a")).await?;
        assert_eq!(source.fetches(), 1);
        Ok(())
    }
}
