//! # Sub-request caching infrastructure
//!
//! Servers rendering a page often fan out to slow upstream APIs. This module lets such calls be
//! wrapped in a cache-aside lookup with stale-while-revalidate semantics: a value that is slightly
//! out of date is served immediately, while a fresh one is computed in the background for the
//! next caller.
//!
//! ## Lifecycle of a cached call
//!
//! A call to [`CacheRunner::run_with_cache`] goes through the following steps:
//!
//! - The caller-supplied key descriptor is normalized into a [`CacheKey`], a SHA-256 hash over a
//!   canonical JSON serialization of the descriptor.
//! - The entry is looked up in the [`CacheStore`] and classified by its age as [`Freshness::Fresh`],
//!   [`Freshness::Stale`] or [`Freshness::Expired`].
//! - A fresh entry is served as is.
//! - A stale entry is served as is, and the [`RevalidationCoordinator`] schedules one background
//!   recomputation for that key, unless one is already in flight.
//! - A missing or expired entry is computed inline. The value is returned to the caller right away
//!   and written to the store in the background.
//!
//! Background work is handed to a [`DeferUntilSettled`] hook, which lets hosts with short-lived
//! execution contexts wait for it.
//!
//! ### Metrics
//!
//! Here is a list of metrics that are collected:
//!
//! - `caches.access`: All accesses that are not bypassing the cache.
//! - `caches.hit`: Accesses served from the store, tagged with `status` (`fresh` or `stale`).
//! - `caches.miss`: Accesses that had to run the computation inline.
//! - `caches.store.error`: Failing store operations, tagged with `op`.
//! - `caches.revalidation`: Finished revalidations, tagged with `result`.
//! - `caches.revalidation.deduplicated`: Stale reads that found a revalidation in flight.
//! - `caches.revalidation.limit_hit`: Stale reads that could not start a revalidation because of
//!   the configured limit.
//! - `caches.file.write`: Entries written by the [`FilesystemStore`].
//!
//! ### Configuration
//!
//! The store is chosen by [`Config::cache_dir`](crate::config::Config::cache_dir): entries are
//! kept on disk when it is set, and in memory otherwise. [`Config::caches`](crate::config::Config::caches)
//! configures the in-memory capacity, a limit on concurrent revalidations and the default
//! strategy of the HTTP wrapper.

mod cache_error;
mod cache_key;
mod defer;
mod events;
mod freshness;
mod revalidation;
mod runner;
mod store;
mod strategy;


pub use cache_error::{CacheError, KeyError, RevalidationError, StoreError};
pub use cache_key::{CacheKey, CacheKeyBuilder, build_key};
pub use defer::{DeferUntilSettled, SpawnDefer, TaskTrackerDefer};
pub use events::{CacheStatus, SubRequestEvent, SubRequestEventSink};
pub use freshness::{Clock, Freshness, ManualClock, SystemClock, classify, system_clock};
pub use revalidation::RevalidationCoordinator;
pub use runner::{CacheRunner, ShouldCache, WithCacheOptions};
pub use store::{CacheEntry, CacheStore, CleanupStats, FilesystemStore, MemoryStore};
pub use strategy::{CacheMode, CachingStrategy, Visibility};
