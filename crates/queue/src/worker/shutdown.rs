//! Cancellation and completion tracking for the worker pool

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Propagates a single cancellation signal to every worker and counts them
/// back in.
///
/// Workers get a child of the root token at construction and check it
/// between batch cycles only, so cancellation never interrupts an open
/// transaction. After all tracked workers finish the pool sleeps for the
/// grace period before declaring shutdown complete.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
    grace_period: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            grace_period,
        }
    }

    /// Root token, for external triggers such as a signal handler
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token handed to a single worker
    pub fn worker_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn a task counted by [`wait_for_workers`](Self::wait_for_workers)
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(task)
    }

    /// Wait until every tracked task has finished. No new tasks can be
    /// tracked afterwards.
    pub async fn wait_for_workers(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        debug!("all tracked workers finished");
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Sleep for the grace period
    pub async fn grace(&self) {
        if !self.grace_period.is_zero() {
            tokio::time::sleep(self.grace_period).await;
        }
    }
}
