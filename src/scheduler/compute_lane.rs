//! Single-threaded compute lane
//!
//! All generation engine work runs here, one job at a time, in submission
//! order. Results come back through oneshot channels so callers can await
//! them from the worker pool without blocking.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread;

use tokio::sync::oneshot;

use crate::core::Error;

type LaneJob = Box<dyn FnOnce() + Send + 'static>;

/// Dedicated FIFO execution lane backed by one OS thread
pub struct ComputeLane {
    sender: Mutex<Option<mpsc::Sender<LaneJob>>>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    submitted: AtomicU64,
}

impl ComputeLane {
    /// Start the lane thread
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<LaneJob>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        log::error!("Compute lane job panicked");
                    }
                }
                log::debug!("Compute lane drained");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
            submitted: AtomicU64::new(0),
        })
    }

    /// Queue a job. Jobs run strictly in submission order.
    ///
    /// If the lane is shut down the returned task resolves to
    /// `Error::SchedulerShutdown`.
    pub fn submit<R, F>(&self, job: F) -> LaneTask<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let wrapped: LaneJob = Box::new(move || {
            // Receiver may be gone if the caller stopped waiting.
            let _ = tx.send(job());
        });

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(wrapped).is_ok() {
                    self.submitted.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => log::warn!("Job submitted to a stopped compute lane"),
        }

        LaneTask { receiver: rx }
    }

    /// Total jobs accepted since the lane started
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs and wait for queued ones to finish
    pub fn shutdown(&self) {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take();

        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            // The last owner may be dropped from a lane job itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ComputeLane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pending result of a compute lane job
pub struct LaneTask<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> Future for LaneTask<R> {
    type Output = Result<R, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| Error::SchedulerShutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let lane = ComputeLane::new("test-lane").unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let order = order.clone();
                lane.submit(move || {
                    order.lock().unwrap().push(i);
                    i * 2
                })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), i * 2);
        }
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
        assert_eq!(lane.submitted(), 16);
    }

    #[tokio::test]
    async fn test_jobs_share_one_thread() {
        let lane = ComputeLane::new("test-lane").unwrap();
        let a = lane.submit(|| thread::current().id()).await.unwrap();
        let b = lane.submit(|| thread::current().id()).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, thread::current().id());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let lane = ComputeLane::new("test-lane").unwrap();
        lane.shutdown();
        let result = lane.submit(|| 1).await;
        assert!(matches!(result, Err(Error::SchedulerShutdown)));
    }

    #[tokio::test]
    async fn test_panicking_job_is_isolated() {
        let lane = ComputeLane::new("test-lane").unwrap();
        let failed = lane.submit(|| -> u32 { panic!("boom") }).await;
        assert!(failed.is_err());
        assert_eq!(lane.submit(|| 7u32).await.unwrap(), 7);
    }
}
