use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::{
    CacheError, CacheKey, CacheStatus, CacheStore, CachingStrategy, Clock, DeferUntilSettled,
    Freshness, RevalidationCoordinator, RevalidationError, SpawnDefer, SubRequestEvent,
    SubRequestEventSink, system_clock,
};
use crate::config::Config;

/// Decides whether a computed value is written to the store.
pub type ShouldCache<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Per-call options of [`CacheRunner::run_with_cache`].
///
/// Without both a [`cache`](Self::with_cache) and a [`strategy`](Self::with_strategy) the call
/// bypasses caching entirely.
pub struct WithCacheOptions<T> {
    strategy: Option<CachingStrategy>,
    cache: Option<Arc<dyn CacheStore>>,
    should_cache_result: Option<ShouldCache<T>>,
    defer: Option<Arc<dyn DeferUntilSettled>>,
    debug_url: Option<Url>,
}

impl<T> Default for WithCacheOptions<T> {
    fn default() -> Self {
        Self {
            strategy: None,
            cache: None,
            should_cache_result: None,
            defer: None,
            debug_url: None,
        }
    }
}

impl<T> fmt::Debug for WithCacheOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WithCacheOptions")
            .field("strategy", &self.strategy)
            .field("cache", &self.cache)
            .field("should_cache_result", &self.should_cache_result.is_some())
            .field("defer", &self.defer)
            .field("debug_url", &self.debug_url)
            .finish()
    }
}

impl<T> WithCacheOptions<T> {
    /// Caches in `cache` with `strategy`.
    pub fn new(cache: Arc<dyn CacheStore>, strategy: CachingStrategy) -> Self {
        Self::default().with_cache(cache).with_strategy(strategy)
    }

    pub fn with_strategy(mut self, strategy: CachingStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Only writes computed values to the store for which `should_cache` returns `true`.
    ///
    /// By default every successfully computed value is written.
    pub fn with_should_cache_result<F>(mut self, should_cache: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.should_cache_result = Some(Arc::new(should_cache));
        self
    }

    /// Overrides the runner's defer hook for this call.
    pub fn with_defer(mut self, defer: Arc<dyn DeferUntilSettled>) -> Self {
        self.defer = Some(defer);
        self
    }

    /// The URL reported to the event sink instead of the key's debug URL.
    pub fn with_debug_url(mut self, url: Url) -> Self {
        self.debug_url = Some(url);
        self
    }

    fn should_cache(&self, value: &T) -> bool {
        self.should_cache_result
            .as_ref()
            .is_none_or(|should_cache| should_cache(value))
    }
}

/// Runs computations through a cache with stale-while-revalidate semantics.
///
/// The runner owns the [`RevalidationCoordinator`], the default [`DeferUntilSettled`] hook, the
/// [`Clock`] used to classify entries, and an optional [`SubRequestEventSink`]. Clones share all
/// of these, so a runner is typically created once per process and cloned into request handlers.
#[derive(Clone)]
pub struct CacheRunner {
    coordinator: RevalidationCoordinator,
    defer: Arc<dyn DeferUntilSettled>,
    clock: Arc<dyn Clock>,
    events: Option<Arc<dyn SubRequestEventSink>>,
    default_strategy: CachingStrategy,
}

impl fmt::Debug for CacheRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRunner")
            .field("coordinator", &self.coordinator)
            .field("defer", &self.defer)
            .field("clock", &self.clock)
            .field("events", &self.events.is_some())
            .field("default_strategy", &self.default_strategy)
            .finish()
    }
}

impl Default for CacheRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheRunner {
    /// Creates a runner that spawns background work on the ambient tokio runtime.
    pub fn new() -> Self {
        Self {
            coordinator: RevalidationCoordinator::new(),
            defer: Arc::new(SpawnDefer),
            clock: system_clock(),
            events: None,
            default_strategy: CachingStrategy::short(),
        }
    }

    /// Creates a runner with the limits and defaults from `config`.
    pub fn from_config(config: &Config) -> Self {
        let caches = &config.caches;
        let mut runner = Self::new();
        if let Some(max) = caches.max_concurrent_revalidations {
            runner = runner.with_max_concurrent_revalidations(max);
        }
        if let Some(strategy) = caches.default_strategy {
            runner = runner.with_default_strategy(strategy);
        }
        runner
    }

    /// Replaces the hook that keeps background writes and revalidations alive.
    pub fn with_defer(mut self, defer: Arc<dyn DeferUntilSettled>) -> Self {
        self.defer = defer;
        self
    }

    /// Replaces the clock used to classify entries.
    ///
    /// Stores stamp entries with their own clock, so tests should share one clock between both.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reports every cache decision to `sink`.
    pub fn with_event_sink(mut self, sink: Arc<dyn SubRequestEventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Limits the number of revalidations running at once.
    pub fn with_max_concurrent_revalidations(mut self, max: usize) -> Self {
        self.coordinator = RevalidationCoordinator::with_limit(max);
        self
    }

    /// The strategy applied to safe requests of
    /// [`fetch_with_server_cache`](Self::fetch_with_server_cache) when none is given.
    pub fn with_default_strategy(mut self, strategy: CachingStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn default_strategy(&self) -> CachingStrategy {
        self.default_strategy
    }

    pub fn coordinator(&self) -> &RevalidationCoordinator {
        &self.coordinator
    }

    /// Runs `action` through the cache.
    ///
    /// - Without a cache or a strategy, or with a `no-store` strategy, `action` is run directly.
    ///   The key descriptor is not even serialized.
    /// - On a miss (or an expired entry) `action` runs inline. Its value is returned and, unless
    ///   [`should_cache_result`](WithCacheOptions::with_should_cache_result) rejects it, written
    ///   in the background.
    /// - A fresh entry is returned as is.
    /// - A stale entry is returned immediately, and `action` runs in the background to replace it,
    ///   unless a revalidation for the same key is already in flight.
    ///
    /// # Errors
    ///
    /// Only failures on the synchronous path are returned: an unserializable key descriptor and
    /// a failing `action` on a miss. Failures of background writes and revalidations are logged.
    pub async fn run_with_cache<K, T, E, F, Fut>(
        &self,
        key: &K,
        action: F,
        options: WithCacheOptions<T>,
    ) -> Result<T, CacheError<E>>
    where
        K: Serialize + ?Sized,
        T: Serialize + DeserializeOwned + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (Some(cache), Some(strategy)) = (options.cache.clone(), options.strategy) else {
            return action().await.map_err(CacheError::Compute);
        };
        if strategy.is_no_store() {
            return action().await.map_err(CacheError::Compute);
        }

        metric!(counter("caches.access") += 1);
        let start_time = self.clock.now();
        let key = CacheKey::from_descriptor(key)?;

        let entry = match cache.get(&key).await {
            Ok(entry) => entry,
            Err(e) => {
                metric!(counter("caches.store.error") += 1, "op" => "get");
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    key = %key,
                    "Failed to read from cache store",
                );
                None
            }
        };

        let now = self.clock.now();
        let cached = entry.and_then(|entry| {
            let freshness = entry.freshness(now);
            if freshness == Freshness::Expired {
                return None;
            }
            match serde_json::from_value::<T>(entry.value) {
                Ok(value) => Some((freshness, value)),
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        key = %key,
                        "Cached value has an unexpected shape, recomputing",
                    );
                    None
                }
            }
        });

        let defer = options.defer.clone().unwrap_or_else(|| self.defer.clone());

        match cached {
            Some((Freshness::Fresh, value)) => {
                metric!(counter("caches.hit") += 1, "status" => "fresh");
                tracing::trace!(key = %key, "Serving fresh cache entry");
                self.emit(&key, &options, CacheStatus::Hit, start_time);
                Ok(value)
            }
            Some((_, value)) => {
                metric!(counter("caches.hit") += 1, "status" => "stale");
                tracing::debug!(key = %key, "Serving stale cache entry");

                let should_cache = options.should_cache_result.clone();
                let task_key = key.clone();
                let revalidate = async move {
                    let value = action()
                        .await
                        .map_err(|e| RevalidationError::Compute(e.to_string()))?;
                    if should_cache.is_none_or(|should_cache| should_cache(&value)) {
                        let value =
                            serde_json::to_value(&value).map_err(RevalidationError::Serialize)?;
                        cache.set(&task_key, value, &strategy).await?;
                    }
                    Ok(())
                };
                let done_key = key.clone();
                self.coordinator
                    .try_revalidate(&key, &*defer, revalidate, move |result| {
                        if result.is_ok() {
                            tracing::trace!(key = %done_key, "Revalidated cache entry");
                        }
                    });

                self.emit(&key, &options, CacheStatus::Stale, start_time);
                Ok(value)
            }
            None => {
                metric!(counter("caches.miss") += 1);
                tracing::trace!(key = %key, "Cache miss, computing");

                let value = action().await.map_err(CacheError::Compute)?;

                if options.should_cache(&value) {
                    match serde_json::to_value(&value) {
                        Ok(json) => {
                            let task_key = key.clone();
                            defer.defer(
                                async move {
                                    if let Err(e) = cache.set(&task_key, json, &strategy).await {
                                        metric!(counter("caches.store.error") += 1, "op" => "set");
                                        tracing::error!(
                                            error = &e as &dyn std::error::Error,
                                            key = %task_key,
                                            "Failed to write to cache store",
                                        );
                                    }
                                }
                                .boxed(),
                            );
                        }
                        Err(e) => {
                            tracing::error!(
                                error = &e as &dyn std::error::Error,
                                key = %key,
                                "Computed value cannot be serialized, not caching",
                            );
                        }
                    }
                }

                self.emit(&key, &options, CacheStatus::Miss, start_time);
                Ok(value)
            }
        }
    }

    fn emit<T>(
        &self,
        key: &CacheKey,
        options: &WithCacheOptions<T>,
        status: CacheStatus,
        start_time: std::time::SystemTime,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        events.emit(SubRequestEvent {
            key: key.to_string(),
            url: options.debug_url.clone().unwrap_or_else(|| key.debug_url()),
            status,
            start_time,
            end_time: self.clock.now(),
        });
    }
}
