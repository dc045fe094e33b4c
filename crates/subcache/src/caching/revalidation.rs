use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;

use super::{CacheKey, DeferUntilSettled, RevalidationError};
use crate::utils::futures::CallOnDrop;

/// Ensures at most one background revalidation per key is in flight in this process.
///
/// The coordinator is shared by every clone of a [`CacheRunner`](super::CacheRunner). It does not
/// coordinate across processes sharing a store: each process may run one revalidation per key.
#[derive(Debug, Clone, Default)]
pub struct RevalidationCoordinator {
    /// Keys with a revalidation in flight.
    in_flight: Arc<Mutex<HashSet<CacheKey>>>,
    /// Remaining revalidation slots, if limited.
    ///
    /// We count down towards zero, and stop spawning once we reach it.
    remaining: Option<Arc<AtomicIsize>>,
}

impl RevalidationCoordinator {
    /// Creates a coordinator without a limit on concurrent revalidations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a coordinator running at most `max` revalidations at once, across all keys.
    ///
    /// Stale reads that would exceed the limit are served without starting a revalidation.
    pub fn with_limit(max: usize) -> Self {
        Self {
            in_flight: Default::default(),
            remaining: Some(Arc::new(AtomicIsize::new(
                isize::try_from(max).unwrap_or(isize::MAX),
            ))),
        }
    }

    /// Whether a revalidation for `key` is currently in flight.
    pub fn is_revalidating(&self, key: &CacheKey) -> bool {
        self.in_flight.lock().unwrap().contains(key)
    }

    /// The number of revalidations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Starts `task` in the background via `defer`, unless a revalidation for `key` is already
    /// in flight or the limit is reached.
    ///
    /// Returns whether the task was started. The key is marked before this function returns, so
    /// concurrent stale reads observe it immediately. It is released once `task` settles, whether
    /// it succeeds, fails, panics or is dropped. Errors of `task` are logged and never propagated,
    /// `on_done` receives the outcome after the key was released.
    pub fn try_revalidate<F, D>(
        &self,
        key: &CacheKey,
        defer: &dyn DeferUntilSettled,
        task: F,
        on_done: D,
    ) -> bool
    where
        F: Future<Output = Result<(), RevalidationError>> + Send + 'static,
        D: FnOnce(Result<(), RevalidationError>) + Send + 'static,
    {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.contains(key) {
            metric!(counter("caches.revalidation.deduplicated") += 1);
            return false;
        }

        if let Some(remaining) = &self.remaining {
            if remaining.fetch_sub(1, Ordering::Relaxed) <= 0 {
                remaining.fetch_add(1, Ordering::Relaxed);

                metric!(counter("caches.revalidation.limit_hit") += 1);
                return false;
            }
        }

        let done_token = {
            let key = key.clone();
            let in_flight = Arc::clone(&self.in_flight);
            let remaining = self.remaining.clone();
            CallOnDrop::new(move || {
                if let Some(remaining) = remaining {
                    remaining.fetch_add(1, Ordering::Relaxed);
                }
                in_flight.lock().unwrap().remove(&key);
            })
        };

        in_flight.insert(key.clone());
        drop(in_flight);

        tracing::trace!("Spawning revalidation for key {}", key);

        let key = key.clone();
        let task = async move {
            let done_token = done_token; // move into the future

            let span = sentry::configure_scope(|scope| scope.get_span());
            let ctx = sentry::TransactionContext::continue_from_span(
                "Sub-request Revalidation",
                "revalidate",
                span,
            );
            let transaction = sentry::start_transaction(ctx);
            sentry::configure_scope(|scope| scope.set_span(Some(transaction.clone().into())));

            let result = task.await;
            match &result {
                Ok(()) => {
                    metric!(counter("caches.revalidation") += 1, "result" => "ok");
                }
                Err(e) => {
                    metric!(counter("caches.revalidation") += 1, "result" => "error");
                    tracing::error!(
                        error = e as &dyn std::error::Error,
                        key = %key,
                        "Revalidation failed",
                    );
                }
            }

            transaction.finish();
            drop(done_token);
            on_done(result);
        };
        defer.defer(task.boxed());

        true
    }
}
