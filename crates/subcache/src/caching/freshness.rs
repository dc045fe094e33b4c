use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use super::CacheEntry;

/// The classification of a stored entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `age <= max_age`: served as is.
    Fresh,
    /// `max_age < age <= max_age + stale_while_revalidate`: served, and revalidated in the
    /// background.
    Stale,
    /// Older than that: treated exactly like a miss.
    Expired,
}

/// Classifies `entry` at time `now`.
///
/// Both boundaries are inclusive towards the fresher state: an entry exactly `max_age` old is
/// still fresh, and one exactly `max_age + stale_while_revalidate` old is still stale.
/// An entry stored "in the future" (clock skew between hosts sharing a store) has an age of zero.
pub fn classify(entry: &CacheEntry, now: SystemTime) -> Freshness {
    let age = entry.age(now);
    if age <= entry.max_age {
        Freshness::Fresh
    } else if age <= entry.max_age.saturating_add(entry.stale_while_revalidate) {
        Freshness::Stale
    } else {
        Freshness::Expired
    }
}

/// A source of wall-clock time.
///
/// Stores stamp entries and the runner classifies them through a [`Clock`], which allows tests to
/// move time forward deterministically with [`ManualClock`].
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> SystemTime;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Returns the shared system clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<SystemTime>>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap()
    }
}
