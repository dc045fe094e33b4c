use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::Value;
use subcache::caching::{
    CacheEntry, CacheKey, CacheRunner, CacheStatus, CacheStore, CachingStrategy, ManualClock,
    MemoryStore, StoreError, SubRequestEvent, TaskTrackerDefer,
};
use subcache::config::HttpConfig;
use subcache::fetch::{CachedResponse, FetchCacheOptions, FetchError, RequestInit, ResponseBody};
use subcache::utils::http::create_client;

/// A store that counts calls to an inner store.
#[derive(Debug)]
pub struct CountingStore {
    inner: Arc<dyn CacheStore>,
    gets: AtomicUsize,
    sets: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<dyn CacheStore>) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
        }
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheStore for CountingStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: Value,
        strategy: &CachingStrategy,
    ) -> Result<(), StoreError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, strategy).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }
}

/// A runner on a manual clock, with an in-memory store and a settle-able defer hook.
pub struct Fixture {
    pub clock: ManualClock,
    pub defer: TaskTrackerDefer,
    pub store: Arc<CountingStore>,
    pub runner: CacheRunner,
    pub client: reqwest::Client,
    events: Arc<Mutex<Vec<SubRequestEvent>>>,
}

/// A manual clock at a fixed point in time.
pub fn manual_clock() -> ManualClock {
    ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000))
}

impl Fixture {
    pub fn new() -> Self {
        let clock = manual_clock();
        let inner = MemoryStore::new(100).with_clock(Arc::new(clock.clone()));
        Self::with_store(clock, Arc::new(inner))
    }

    pub fn with_store(clock: ManualClock, store: Arc<dyn CacheStore>) -> Self {
        let defer = TaskTrackerDefer::new();
        let events = Arc::new(Mutex::new(Vec::new()));

        let sink = {
            let events = events.clone();
            move |event: SubRequestEvent| events.lock().unwrap().push(event)
        };
        let runner = CacheRunner::new()
            .with_clock(Arc::new(clock.clone()))
            .with_defer(Arc::new(defer.clone()))
            .with_event_sink(Arc::new(sink));

        Self {
            clock,
            defer,
            store: Arc::new(CountingStore::new(store)),
            runner,
            client: create_client(&HttpConfig::default()).unwrap(),
            events,
        }
    }

    /// Options with this fixture's store and no explicit strategy.
    pub fn options(&self) -> FetchCacheOptions {
        FetchCacheOptions::new(self.store.clone())
    }

    /// Fetches `url` and waits for all background work to settle.
    pub async fn fetch(
        &self,
        url: &str,
        request_init: RequestInit,
        options: FetchCacheOptions,
    ) -> Result<(ResponseBody, CachedResponse), FetchError> {
        let result = self
            .runner
            .fetch_with_server_cache(&self.client, url, request_init, options)
            .await;
        self.defer.settled().await;
        result
    }

    /// Statuses of all calls so far, and resets them.
    pub fn statuses(&self) -> Vec<CacheStatus> {
        let events = std::mem::take(&mut *self.events.lock().unwrap());
        events.into_iter().map(|event| event.status).collect()
    }

    pub fn events(&self) -> Vec<SubRequestEvent> {
        self.events.lock().unwrap().clone()
    }
}
