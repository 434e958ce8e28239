//! State shared between a streaming request and whoever started it
//!
//! The issuing thread only ever touches `RequestControl` through a
//! `StreamingHandle`. Queued engine jobs reach it through a weak
//! reference, so a request that already resolved reads as cancelled.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::task::JoinHandle;

use crate::core::{Error, ResourceId, Result, StreamingConfig};
use crate::generation::GenerationFacade;
use crate::scheduler::{CancelSource, Scheduler};
use crate::streaming::events::StreamingEvents;
use crate::streaming::transfer::TransferCanceller;

struct ControlState<S> {
    state: S,
    irreversible: bool,
    transfers: Vec<TransferCanceller>,
}

/// Cancellation flag, current stage and transfer cancellers of one request
pub struct RequestControl<S> {
    cancelled: AtomicBool,
    inner: Mutex<ControlState<S>>,
}

impl<S: Copy + Debug + Send + 'static> RequestControl<S> {
    pub fn new(initial: S) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            inner: Mutex::new(ControlState { state: initial, irreversible: false, transfers: Vec::new() }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ControlState<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request cancellation.
    ///
    /// Returns false if the request already entered its irreversible stage,
    /// in which case it runs to completion.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.irreversible {
            log::debug!("Cancel deferred: request is in {:?}", inner.state);
            return false;
        }
        self.cancelled.store(true, Ordering::Release);
        for transfer in inner.transfers.drain(..) {
            transfer.cancel();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> S {
        self.lock().state
    }

    pub fn set_state(&self, state: S) {
        let mut inner = self.lock();
        log::trace!("{:?} -> {:?}", inner.state, state);
        inner.state = state;
    }

    /// Track a transfer so cancelling the request cancels it too.
    ///
    /// Register before streaming: a transfer registered after cancellation
    /// is cancelled on the spot and never reaches the backend.
    pub fn register_transfer(&self, transfer: TransferCanceller) {
        let mut inner = self.lock();
        if self.is_cancelled() {
            transfer.cancel();
        } else {
            inner.transfers.push(transfer);
        }
    }

    /// Stage boundary check
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() { Err(Error::Cancelled) } else { Ok(()) }
    }

    /// Enter the stage that can no longer be undone.
    ///
    /// Check-and-set under the lock: either cancellation wins and this
    /// returns false, or the stage is entered and later cancels are ignored.
    pub fn enter_irreversible(&self, state: S) -> bool {
        let mut inner = self.lock();
        if self.is_cancelled() {
            return false;
        }
        inner.irreversible = true;
        inner.state = state;
        true
    }

    /// Weak probe for jobs queued on the compute lane
    pub fn probe(self: &Arc<Self>) -> Weak<dyn CancelSource> {
        let source: Arc<dyn CancelSource> = self.clone();
        Arc::downgrade(&source)
    }
}

impl<S: Send> CancelSource for RequestControl<S> {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// What a finished request did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingSummary {
    pub resource: ResourceId,
    /// LODs or mips written, in the order they were produced
    pub levels: Vec<u8>,
    /// Levels that were padded or zero-filled
    pub degraded_levels: Vec<u8>,
    /// Blocks zero-filled after a storage failure
    pub failed_blocks: usize,
    pub buffers_marked_dirty: bool,
}

/// How a request resolved
#[derive(Debug)]
pub enum RequestOutcome {
    Completed(StreamingSummary),
    /// Cancelled before its irreversible stage; nothing was committed
    Cancelled,
    /// Fatal error; nothing was committed
    Aborted(Error),
}

impl RequestOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RequestOutcome::Completed(_))
    }

    pub fn summary(&self) -> Option<&StreamingSummary> {
        match self {
            RequestOutcome::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

/// Caller's handle on a running request
pub struct StreamingHandle<S> {
    resource: ResourceId,
    control: Arc<RequestControl<S>>,
    join: JoinHandle<RequestOutcome>,
}

impl<S: Copy + Debug + Send + 'static> StreamingHandle<S> {
    pub(crate) fn new(resource: ResourceId, control: Arc<RequestControl<S>>, join: JoinHandle<RequestOutcome>) -> Self {
        Self { resource, control, join }
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Cancel cooperatively; see `RequestControl::cancel`
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    pub fn state(&self) -> S {
        self.control.state()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> RequestOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => RequestOutcome::Cancelled,
            Err(e) => {
                log::error!("Streaming request {} panicked: {}", self.resource, e);
                RequestOutcome::Aborted(Error::SchedulerShutdown)
            }
        }
    }
}

/// Collaborators every request needs
#[derive(Clone)]
pub(crate) struct RequestContext {
    pub scheduler: Arc<Scheduler>,
    pub facade: GenerationFacade,
    pub config: StreamingConfig,
    pub events: Arc<StreamingEvents>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::storage::StorageBackend;
    use crate::streaming::transfer::BlockTransfer;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Stage {
        Start,
        Commit,
    }

    #[test]
    fn test_cancel_before_irreversible() {
        let control = RequestControl::new(Stage::Start);
        assert!(control.checkpoint().is_ok());
        assert!(control.cancel());
        assert!(control.checkpoint().unwrap_err().is_cancelled());
        assert!(!control.enter_irreversible(Stage::Commit));
        assert_eq!(control.state(), Stage::Start);
    }

    #[test]
    fn test_cancel_after_irreversible_is_deferred() {
        let control = RequestControl::new(Stage::Start);
        assert!(control.enter_irreversible(Stage::Commit));
        assert!(!control.cancel());
        assert!(!control.is_cancelled());
        assert_eq!(control.state(), Stage::Commit);
    }

    #[test]
    fn test_probe_reads_cancellation_and_drop() {
        let control = RequestControl::new(Stage::Start);
        let probe = control.probe();
        assert!(!crate::scheduler::probe_cancelled(&probe));
        control.cancel();
        assert!(crate::scheduler::probe_cancelled(&probe));

        let other = RequestControl::new(Stage::Start);
        let probe = other.probe();
        drop(other);
        assert!(crate::scheduler::probe_cancelled(&probe));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_late_registration_cancels_transfer() {
        let scheduler = Scheduler::with_current_runtime().unwrap();
        let cache = Arc::new(crate::streaming::cache::MemoryContentCache::new(4));
        let mut transfer = BlockTransfer::new(StorageBackend::cache(cache.clone(), crate::streaming::cache::CacheKey(0)));
        transfer
            .add_block(
                crate::streaming::block::StreamableBlock::default(),
                crate::streaming::storage::DataKind::Model,
                0,
                crate::streaming::buffer::SharedBuffer::zeroed(4).whole(),
            )
            .unwrap();

        let control = RequestControl::new(Stage::Start);
        control.cancel();
        control.register_transfer(transfer.canceller());

        let report = transfer.stream(&scheduler).unwrap().wait().await;
        assert_eq!(report.cancelled, 1);
        assert_eq!(cache.batch_count(), 0);
    }
}
