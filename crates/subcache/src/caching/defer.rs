use std::fmt;

use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tokio_util::task::TaskTracker;

/// Keeps background work alive past the response that triggered it.
///
/// Hosts that tear down a request's execution context once the response is sent need to be told
/// about work that should outlive it. Revalidations and cache writes are handed to this hook.
pub trait DeferUntilSettled: Send + Sync + fmt::Debug {
    /// Runs `task` to completion in the background.
    fn defer(&self, task: BoxFuture<'static, ()>);
}

/// Spawns deferred work on the ambient tokio runtime.
///
/// This is the default: a long-running server process keeps spawned tasks alive on its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnDefer;

impl DeferUntilSettled for SpawnDefer {
    fn defer(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

/// Tracks deferred work so that it can be awaited.
///
/// Use this for short-lived executions, for example one-shot CLI invocations or tests, which
/// must not exit before pending revalidations have settled.
#[derive(Debug, Clone, Default)]
pub struct TaskTrackerDefer {
    tracker: TaskTracker,
}

impl TaskTrackerDefer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of deferred tasks that are still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until all tasks deferred so far have completed.
    ///
    /// Tasks may still be deferred afterwards.
    pub async fn settled(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl DeferUntilSettled for TaskTrackerDefer {
    fn defer(&self, task: BoxFuture<'static, ()>) {
        self.tracker
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn test_task_tracker_settles() {
        let defer = TaskTrackerDefer::new();
        let done = Arc::new(AtomicBool::new(false));

        let flag = done.clone();
        defer.defer(
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
            }
            .boxed(),
        );
        assert_eq!(defer.pending(), 1);

        defer.settled().await;
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(defer.pending(), 0);

        // still usable after settling
        defer.defer(async {}.boxed());
        defer.settled().await;
    }

    #[tokio::test]
    async fn test_spawn_defer() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        SpawnDefer.defer(
            async move {
                let _ = tx.send(42);
            }
            .boxed(),
        );
        assert_eq!(rx.await.unwrap(), 42);
    }
}
