use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::{
    sync::{CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned},
    task::TaskTracker,
};

/// A [`TaskTracker`] paired with a [`CancellationToken`].
///
/// Every flow belonging to a connection (or to a broker stream) is spawned
/// on one of these, so that cancelling the set stops all of them and
/// [`TaskSet::wait`] resolves once every flow has released its resources.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskSet {
    tasks: TaskTracker,
    token: CancellationToken,
}

impl TaskSet {
    /// Create an empty set.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A child set: cancelled when this set is cancelled, or independently.
    pub(crate) fn child(&self) -> Self {
        Self {
            tasks: TaskTracker::new(),
            token: self.token.child_token(),
        }
    }

    /// Cancel all tasks in the set.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the set is cancelled.
    pub(crate) fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Resolves once every spawned task has finished. Spawning must be
    /// done before calling this; the tracker is closed here.
    pub(crate) async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Cancel and wait for all tasks to finish.
    pub(crate) async fn shutdown(&self) {
        self.cancel();
        self.wait().await;
    }

    /// Spawn a future that is dropped outright on cancellation. The handle
    /// yields `None` when the task was cancelled before completing.
    pub(crate) fn spawn_cancellable<F>(&self, task: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let token = self.token.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => None,
                result = task => Some(result),
            }
        })
    }

    /// Spawn a future that observes cancellation itself: the closure
    /// receives the cancellation future and decides how to wind down.
    pub(crate) fn spawn_graceful<F, Fut>(&self, task: F) -> JoinHandle<Fut::Output>
    where
        F: FnOnce(WaitForCancellationFutureOwned) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let cancel = self.token.clone().cancelled_owned();
        self.tasks.spawn(task(cancel))
    }
}
