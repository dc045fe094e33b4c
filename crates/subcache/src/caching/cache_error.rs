use std::io;

use thiserror::Error;

/// A key descriptor that cannot be canonically serialized.
#[derive(Debug, Error)]
pub enum KeyError {
    /// One part of the descriptor failed to serialize.
    ///
    /// This happens for maps with non-string keys, or for types whose `Serialize` implementation
    /// reports an error.
    #[error("cache key part {index} cannot be serialized")]
    Unserializable {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// An error of a [`CacheStore`](super::CacheStore) backend.
///
/// A missing key is never an error, see [`CacheStore::get`](super::CacheStore::get).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing storage failed.
    #[error("cache store i/o failed")]
    Io(#[from] io::Error),
    /// A stored entry could not be (de)serialized.
    #[error("cache entry is malformed")]
    Malformed(#[from] serde_json::Error),
}

/// A failure of a background revalidation.
///
/// These are logged at the revalidation boundary and never reach the caller that triggered the
/// stale read.
#[derive(Debug, Error)]
pub enum RevalidationError {
    /// The computation itself failed.
    #[error("SWR in sub-request failed: {0}")]
    Compute(String),
    /// The freshly computed value could not be serialized for the store.
    #[error("revalidated value cannot be serialized")]
    Serialize(#[source] serde_json::Error),
    /// The store rejected the write.
    #[error("failed to store revalidated value")]
    Store(#[from] StoreError),
}

/// The error returned to callers of [`run_with_cache`](super::CacheRunner::run_with_cache).
///
/// Only synchronous failures show up here. Errors of background tasks are logged and dropped.
#[derive(Debug, Error)]
pub enum CacheError<E> {
    /// The key descriptor could not be normalized into a store key.
    #[error(transparent)]
    UnserializableKey(#[from] KeyError),
    /// The wrapped computation failed on the miss path. Nothing was cached.
    #[error("computation failed: {0}")]
    Compute(E),
}

impl<E> CacheError<E> {
    /// Returns the computation error, if this is one.
    pub fn into_compute(self) -> Option<E> {
        match self {
            Self::Compute(e) => Some(e),
            Self::UnserializableKey(_) => None,
        }
    }
}
