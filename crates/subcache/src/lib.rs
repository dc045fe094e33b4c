//! Sub-request caching for servers that fan out to upstream APIs.
//!
//! The entry point is [`CacheRunner`](caching::CacheRunner): it wraps a computation in a
//! cache-aside lookup with stale-while-revalidate semantics, and
//! [`fetch_with_server_cache`](caching::CacheRunner::fetch_with_server_cache) specializes that for
//! outbound HTTP requests.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod fetch;
pub mod logging;
pub mod utils;
