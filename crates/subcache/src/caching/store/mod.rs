//! Backends that persist [`CacheEntry`]s.
//!
//! The orchestrator is polymorphic over the [`CacheStore`] trait and never assumes that a
//! lookup or a write completes synchronously.

use std::fmt;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::freshness::{Freshness, classify};
use super::{CacheKey, CachingStrategy, StoreError};

mod fs;
mod memory;

pub use fs::{CleanupStats, FilesystemStore};
pub use memory::MemoryStore;

/// The persisted unit of a cache store.
///
/// Entries are never mutated in place, a write always replaces the whole entry. The freshness
/// windows are copied from the strategy at write time, so an entry can be classified without
/// the original [`CachingStrategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The serialized value.
    pub value: Value,
    /// When the entry was written.
    #[serde(with = "humantime_serde")]
    pub stored_at: SystemTime,
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    #[serde(with = "humantime_serde")]
    pub stale_while_revalidate: Duration,
}

impl CacheEntry {
    /// Creates an entry for `value` written at `stored_at`.
    pub fn new(value: Value, strategy: &CachingStrategy, stored_at: SystemTime) -> Self {
        Self {
            value,
            stored_at,
            max_age: strategy.max_age,
            stale_while_revalidate: strategy.stale_while_revalidate,
        }
    }

    /// The age of this entry at `now`, clamped to zero.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.stored_at).unwrap_or_default()
    }

    /// Shorthand for [`classify`].
    pub fn freshness(&self, now: SystemTime) -> Freshness {
        classify(self, now)
    }
}

/// A key-value store holding [`CacheEntry`]s.
///
/// Implementations may be in-memory, disk-backed, or talk to a remote key-value service.
/// Both operations may suspend.
#[async_trait]
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// Looks up the entry for `key`.
    ///
    /// Returns `Ok(None)` on a miss; a missing key is never an error.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError>;

    /// Replaces the entry for `key`, stamping it with the store's current time.
    async fn set(
        &self,
        key: &CacheKey,
        value: Value,
        strategy: &CachingStrategy,
    ) -> Result<(), StoreError>;

    /// Removes the entry for `key`, returning whether there was one.
    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError>;
}
