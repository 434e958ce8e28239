//! Scheduler injected into every component that submits work
//!
//! - Worker pool: tokio runtime, runs transfers, conversion and stage chaining
//! - Compute lane: one dedicated thread for generation engine calls
//! - Low-priority tasks: cancellable background work

pub mod compute_lane;
pub mod task;

pub use compute_lane::{ComputeLane, LaneTask};
pub use task::{CancelSource, TaskHandle, probe_cancelled};

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

use crate::core::{Result, StreamingConfig};

const COMPUTE_LANE_NAME: &str = "procgen-compute";

/// Owns the worker pool handle and the compute lane.
///
/// Lifecycle is tied to the owner: dropping the scheduler drains the
/// compute lane and, if it owns one, shuts the runtime down.
pub struct Scheduler {
    handle: Handle,
    lane: Arc<ComputeLane>,
    /// Dedicated runtime (None when borrowing the caller's runtime)
    runtime: Option<Runtime>,
}

impl Scheduler {
    /// Create a scheduler with its own multi-threaded runtime
    pub fn new(config: &StreamingConfig) -> Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name("procgen-worker");
        if config.worker_threads > 0 {
            builder.worker_threads(config.worker_threads);
        }
        let runtime = builder.build()?;

        Ok(Self {
            handle: runtime.handle().clone(),
            lane: Arc::new(ComputeLane::new(COMPUTE_LANE_NAME)?),
            runtime: Some(runtime),
        })
    }

    /// Create a scheduler on the current tokio runtime
    ///
    /// Panics if called outside a tokio runtime context.
    pub fn with_current_runtime() -> Result<Self> {
        Ok(Self {
            handle: Handle::current(),
            lane: Arc::new(ComputeLane::new(COMPUTE_LANE_NAME)?),
            runtime: None,
        })
    }

    /// Runtime handle of the worker pool
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn compute_lane(&self) -> &Arc<ComputeLane> {
        &self.lane
    }

    /// Spawn a continuation on the worker pool
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Run synchronous work (storage reads, conversion) off the async workers
    pub fn spawn_blocking<R, F>(&self, f: F) -> JoinHandle<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.handle.spawn_blocking(f)
    }

    /// Spawn background work that may be cancelled by the caller
    pub fn spawn_low_priority<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        TaskHandle::new(self.handle.spawn(async move {
            tokio::task::yield_now().await;
            future.await
        }))
    }

    /// Block the current thread on a future (only for owned runtimes / sync callers)
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        match &self.runtime {
            Some(runtime) => runtime.block_on(future),
            None => self.handle.block_on(future),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.lane.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owned_runtime_runs_tasks() {
        let scheduler = Scheduler::new(&StreamingConfig { worker_threads: 2, ..Default::default() }).unwrap();
        let value = scheduler.block_on(async { 21 * 2 });
        assert_eq!(value, 42);

        let joined = scheduler.block_on(scheduler.spawn(async { "done" })).unwrap();
        assert_eq!(joined, "done");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_low_priority_cancel() {
        let scheduler = Scheduler::with_current_runtime().unwrap();
        let handle = scheduler.spawn_low_priority(async {
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
            1
        });
        handle.cancel();
        assert!(matches!(handle.wait().await, Err(crate::core::Error::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compute_lane_from_scheduler() {
        let scheduler = Scheduler::with_current_runtime().unwrap();
        let result = scheduler.compute_lane().submit(|| 5).await.unwrap();
        assert_eq!(result, 5);
    }
}
