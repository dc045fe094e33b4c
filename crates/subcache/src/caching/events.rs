use std::fmt;
use std::time::SystemTime;

use url::Url;

/// How a cached call was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    /// Nothing usable was stored, the computation ran inline.
    Miss,
    /// A fresh value was served.
    Hit,
    /// A stale value was served and a revalidation may have been started.
    Stale,
}

impl AsRef<str> for CacheStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Miss => "MISS",
            Self::Hit => "HIT",
            Self::Stale => "STALE",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// A record of one cached call, for development tooling.
#[derive(Debug, Clone, PartialEq)]
pub struct SubRequestEvent {
    /// The hex representation of the normalized key.
    pub key: String,
    /// The synthetic debug URL of the key, or the upstream URL for HTTP sub-requests.
    pub url: Url,
    pub status: CacheStatus,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
}

/// Receives a [`SubRequestEvent`] for every cached call.
pub trait SubRequestEventSink: Send + Sync {
    fn emit(&self, event: SubRequestEvent);
}

impl<F> SubRequestEventSink for F
where
    F: Fn(SubRequestEvent) + Send + Sync,
{
    fn emit(&self, event: SubRequestEvent) {
        self(event)
    }
}
