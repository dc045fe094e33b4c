use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;

use super::{CacheEntry, CacheStore};
use crate::caching::freshness::{Clock, Freshness, system_clock};
use crate::caching::{CacheKey, CachingStrategy, StoreError};

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem {
    /// When to evict this item from the in-memory cache.
    deadline: Instant,
    /// The actual entry.
    entry: CacheEntry,
}

type InMemoryCache = moka::future::Cache<CacheKey, InMemoryItem>;

/// A struct implementing [`moka::Expiry`] that uses the [`InMemoryItem`] [`Instant`] as the explicit
/// expiration time.
struct EntryExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl moka::Expiry<CacheKey, InMemoryItem> for EntryExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &InMemoryItem,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &InMemoryItem,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

/// A bounded, process-local [`CacheStore`].
///
/// Entries are evicted once their whole servable lifetime (`max_age + stale_while_revalidate`)
/// has passed, or earlier when the capacity is exceeded.
#[derive(Clone)]
pub struct MemoryStore {
    cache: InMemoryCache,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.cache.entry_count())
            .field("clock", &self.clock)
            .finish()
    }
}

impl MemoryStore {
    /// Creates a store holding at most `capacity` entries.
    pub fn new(capacity: u64) -> Self {
        let cache = InMemoryCache::builder()
            .max_capacity(capacity)
            .name("subrequests")
            .expire_after(EntryExpiration)
            .build();

        Self {
            cache,
            clock: system_clock(),
        }
    }

    /// Replaces the clock used to stamp and classify entries.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The approximate number of entries in the store.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let Some(item) = self.cache.get(key).await else {
            return Ok(None);
        };

        if item.entry.freshness(self.clock.now()) == Freshness::Expired {
            tracing::trace!(%key, "Dropping expired in-memory entry");
            self.cache.invalidate(key).await;
            return Ok(None);
        }
        Ok(Some(item.entry))
    }

    async fn set(
        &self,
        key: &CacheKey,
        value: Value,
        strategy: &CachingStrategy,
    ) -> Result<(), StoreError> {
        if strategy.is_no_store() {
            return Ok(());
        }

        let entry = CacheEntry::new(value, strategy, self.clock.now());
        let deadline = Instant::now() + strategy.stored_max_age();
        self.cache
            .insert(key.clone(), InMemoryItem { deadline, entry })
            .await;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(self.cache.remove(key).await.is_some())
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use serde_json::json;

    use super::*;
    use crate::caching::ManualClock;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = MemoryStore::new(100);
        let key = CacheKey::for_testing("product/42");

        assert_eq!(store.get(&key).await.unwrap(), None);

        store
            .set(&key, json!({"title": "Widget"}), &CachingStrategy::long())
            .await
            .unwrap();
        let entry = store.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.value, json!({"title": "Widget"}));
        assert_eq!(entry.max_age, Duration::from_secs(3600));

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let clock = ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000));
        let store = MemoryStore::new(100).with_clock(Arc::new(clock.clone()));
        let key = CacheKey::for_testing("product/42");

        store
            .set(&key, json!(1), &CachingStrategy::short())
            .await
            .unwrap();

        clock.advance(Duration::from_secs(5));
        let entry = store.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.freshness(clock.now()), Freshness::Stale);

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.get(&key).await.unwrap(), None);
        assert!(!store.delete(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_store_is_not_written() {
        let store = MemoryStore::new(100);
        let key = CacheKey::for_testing("product/42");

        store
            .set(&key, json!(1), &CachingStrategy::no_store())
            .await
            .unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_moka_eviction() {
        let store = MemoryStore::new(100);
        let key = CacheKey::for_testing("short-lived");
        let strategy = CachingStrategy::custom(Duration::from_millis(20), Duration::from_millis(20));

        store.set(&key, json!(1), &strategy).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.cache.get(&key).await.map(|item| item.entry), None);
    }
}
