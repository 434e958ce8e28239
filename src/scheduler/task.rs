//! Task handles and cancellation probes

use std::sync::Weak;

use tokio::task::JoinHandle;

use crate::core::Error;

/// Something queued work can ask "should I still run?"
///
/// Queued jobs hold a weak reference to their source, so a dropped owner
/// counts as cancelled.
pub trait CancelSource: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

/// Whether a weak cancellation probe says the work should be skipped
pub fn probe_cancelled(probe: &Weak<dyn CancelSource>) -> bool {
    probe.upgrade().map_or(true, |source| source.is_cancelled())
}

/// Handle to a low-priority background task that can be cancelled
pub struct TaskHandle<T> {
    join: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(join: JoinHandle<T>) -> Self {
        Self { join }
    }

    /// Abort the task at its next suspension point
    pub fn cancel(&self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the result. A cancelled task yields `Error::Cancelled`.
    pub async fn wait(self) -> Result<T, Error> {
        self.join.await.map_err(|e| {
            if e.is_cancelled() {
                Error::Cancelled
            } else {
                log::error!("Background task panicked: {}", e);
                Error::SchedulerShutdown
            }
        })
    }
}
