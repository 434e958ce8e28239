//! Block transfer: batched async reads into caller-supplied views
//!
//! Blocks are registered with `add_block`, then `stream` issues them all at
//! once and returns a task that resolves when every block has landed (or
//! been zero-filled). The cancellation flag and the pending counter are the
//! only state shared with the completion side, and one lock guards them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;

use crate::core::{Error, Result};
use crate::scheduler::Scheduler;
use crate::streaming::block::StreamableBlock;
use crate::streaming::buffer::BufferView;
use crate::streaming::cache::{decompress_value, ValueId};
use crate::streaming::storage::{DataKind, StorageBackend};

/// One block waiting to be read
#[derive(Debug, Clone)]
struct PendingBlockRead {
    index: usize,
    block: StreamableBlock,
    kind: DataKind,
    resource_kind: u16,
    dest: BufferView,
}

#[derive(Debug, Default)]
struct TransferState {
    cancelled: bool,
    pending: usize,
    completed: usize,
    failed: usize,
    skipped: usize,
    landed: Vec<usize>,
}

type SharedState = Arc<Mutex<TransferState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, TransferState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How one block resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockOutcome {
    Landed,
    Failed,
    Skipped,
}

/// Fire the completion signal of block `index`. Called exactly once per block.
fn complete(state: &mut TransferState, index: usize, outcome: BlockOutcome) {
    state.pending = state.pending.saturating_sub(1);
    state.completed += 1;
    match outcome {
        BlockOutcome::Landed => state.landed.push(index),
        BlockOutcome::Failed => state.failed += 1,
        BlockOutcome::Skipped => state.skipped += 1,
    }
}

/// Summary of a finished transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Blocks registered
    pub blocks: usize,
    /// Completion signals fired (always equals `blocks`)
    pub completed: usize,
    /// Blocks zero-filled after a backend failure
    pub failed: usize,
    /// Blocks whose result was skipped or discarded by cancellation
    pub cancelled: usize,
    /// Registration indices of the blocks whose bytes were written, ascending
    pub landed: Vec<usize>,
}

impl TransferReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    /// Whether the block registered at `index` (the n-th `add_block` call)
    /// landed. Failed and skipped blocks did not.
    pub fn has_landed(&self, index: usize) -> bool {
        self.landed.binary_search(&index).is_ok()
    }

    fn from_state(blocks: usize, state: &TransferState) -> Self {
        let mut landed = state.landed.clone();
        landed.sort_unstable();
        Self {
            blocks,
            completed: state.completed,
            failed: state.failed + state.pending,
            cancelled: state.skipped,
            landed,
        }
    }
}

/// Batched transfer from one storage backend
pub struct BlockTransfer {
    backend: StorageBackend,
    blocks: Vec<PendingBlockRead>,
    state: SharedState,
    streamed: bool,
}

impl BlockTransfer {
    pub fn new(backend: StorageBackend) -> Self {
        Self {
            backend,
            blocks: Vec::new(),
            state: Arc::new(Mutex::new(TransferState::default())),
            streamed: false,
        }
    }

    /// Register one block. Must be called before `stream`.
    ///
    /// # Arguments
    /// * `block` - Where the bytes live in bulk storage
    /// * `kind` - Bulk file category the block belongs to
    /// * `resource_kind` - Streamed resource kind, for logging only
    /// * `dest` - View the bytes land in; its length is the read size
    ///
    /// # Returns
    /// `TransferAlreadyStreamed` once `stream` has been called.
    pub fn add_block(
        &mut self,
        block: StreamableBlock,
        kind: DataKind,
        resource_kind: u16,
        dest: BufferView,
    ) -> Result<()> {
        if self.streamed {
            return Err(Error::TransferAlreadyStreamed);
        }
        let index = self.blocks.len();
        self.blocks.push(PendingBlockRead { index, block, kind, resource_kind, dest });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Request cancellation (best effort)
    pub fn cancel(&self) {
        lock(&self.state).cancelled = true;
    }

    /// Cancellation handle, usable before and after `stream`
    pub fn canceller(&self) -> TransferCanceller {
        TransferCanceller { state: Arc::downgrade(&self.state) }
    }

    /// Issue every registered block and return the aggregate task.
    ///
    /// Bulk backends get one blocking read per block, sharing open file
    /// handles; the cache backend gets a single batched get. Never blocks
    /// the calling thread.
    ///
    /// # Returns
    /// A task resolving to the `TransferReport` once every block has fired
    /// its completion signal, or `TransferAlreadyStreamed` on a second call.
    pub fn stream(&mut self, scheduler: &Scheduler) -> Result<TransferTask> {
        if self.streamed {
            return Err(Error::TransferAlreadyStreamed);
        }
        self.streamed = true;

        let blocks = std::mem::take(&mut self.blocks);
        let total = blocks.len();
        lock(&self.state).pending = total;

        log::trace!("Streaming {} blocks from {:?}", total, self.backend);

        let handles: Vec<JoinHandle<()>> = match &self.backend {
            StorageBackend::Bulk(registry) => blocks
                .into_iter()
                .map(|read| {
                    let registry = registry.clone();
                    let state = self.state.clone();
                    scheduler.spawn_blocking(move || read_bulk_block(&registry, read, &state))
                })
                .collect(),
            StorageBackend::Cache { cache, key } if total > 0 => {
                let cache = cache.clone();
                let key = *key;
                let state = self.state.clone();
                vec![scheduler.spawn_blocking(move || {
                    if lock(&state).cancelled {
                        let mut guard = lock(&state);
                        for read in &blocks {
                            complete(&mut guard, read.index, BlockOutcome::Skipped);
                        }
                        return;
                    }

                    let ids: Vec<ValueId> = blocks.iter().map(|r| ValueId::for_block(r.kind, &r.block)).collect();
                    let values = cache.batch_get(key, &ids);

                    let mut guard = lock(&state);
                    for (index, read) in blocks.iter().enumerate() {
                        let outcome = if guard.cancelled {
                            BlockOutcome::Skipped
                        } else {
                            match values.get(index) {
                                Some(Ok(stored)) => land_cached(read, stored),
                                Some(Err(e)) => {
                                    log::warn!("Cache get failed for block {:?}: {}", read.block, e);
                                    read.dest.fill_zero();
                                    BlockOutcome::Failed
                                }
                                None => {
                                    log::warn!("Cache returned no value for block {:?}", read.block);
                                    read.dest.fill_zero();
                                    BlockOutcome::Failed
                                }
                            }
                        };
                        complete(&mut guard, read.index, outcome);
                    }
                })]
            }
            StorageBackend::Cache { .. } => Vec::new(),
        };

        let state = self.state.clone();
        let join = scheduler.spawn(async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    log::error!("Block read task failed: {}", e);
                }
            }
            TransferReport::from_state(total, &lock(&state))
        });

        Ok(TransferTask { state: self.state.clone(), join })
    }
}

/// Decompress a cache value into its view, zero-filling on any mismatch
fn land_cached(read: &PendingBlockRead, stored: &[u8]) -> BlockOutcome {
    match decompress_value(stored) {
        Ok(raw) => {
            if raw.len() != read.dest.len() {
                log::warn!(
                    "Cached block {:?} size mismatch: expected {} bytes, got {}",
                    read.block,
                    read.dest.len(),
                    raw.len()
                );
            }
            read.dest.write(&raw);
            BlockOutcome::Landed
        }
        Err(e) => {
            log::warn!("Cached block {:?} is corrupt: {}", read.block, e);
            read.dest.fill_zero();
            BlockOutcome::Failed
        }
    }
}

/// Read one block from bulk storage (runs on the blocking pool)
fn read_bulk_block(
    registry: &crate::streaming::storage::OpenFileRegistry,
    read: PendingBlockRead,
    state: &SharedState,
) {
    {
        let mut guard = lock(state);
        if guard.cancelled {
            complete(&mut guard, read.index, BlockOutcome::Skipped);
            return;
        }
    }

    let mut scratch = vec![0u8; read.dest.len()];
    let result = registry
        .acquire(read.kind, read.block.file_id)
        .and_then(|file| file.read_at(read.block.offset, &mut scratch));

    let mut guard = lock(state);
    let outcome = if guard.cancelled {
        // Read finished after cancellation: discard the bytes
        BlockOutcome::Skipped
    } else {
        match result {
            Ok(()) => {
                read.dest.write(&scratch);
                log::trace!(
                    "Block landed: file {} offset {} ({} bytes, resource kind {})",
                    read.block.file_id,
                    read.block.offset,
                    scratch.len(),
                    read.resource_kind
                );
                BlockOutcome::Landed
            }
            Err(source) => {
                let err = Error::StorageReadFailure {
                    file_id: read.block.file_id,
                    offset: read.block.offset,
                    source,
                };
                log::error!("{}; zero-filling {} bytes", err, read.dest.len());
                read.dest.fill_zero();
                BlockOutcome::Failed
            }
        }
    };
    complete(&mut guard, read.index, outcome);
}

/// Aggregate completion of a streamed transfer
pub struct TransferTask {
    state: SharedState,
    join: JoinHandle<TransferReport>,
}

impl TransferTask {
    /// Request cancellation of blocks not yet landed
    pub fn cancel(&self) {
        lock(&self.state).cancelled = true;
    }

    /// Cancellation handle that can outlive the borrow of this task
    pub fn canceller(&self) -> TransferCanceller {
        TransferCanceller { state: Arc::downgrade(&self.state) }
    }

    /// Blocks still in flight
    pub fn pending(&self) -> usize {
        lock(&self.state).pending
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait until every block has fired its completion signal
    pub async fn wait(self) -> TransferReport {
        match self.join.await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Transfer task failed: {}", e);
                let guard = lock(&self.state);
                // Blocks still pending never fired and count as failed
                TransferReport::from_state(guard.completed + guard.pending, &guard)
            }
        }
    }
}

/// Weak cancellation handle for a streamed transfer
#[derive(Debug, Clone)]
pub struct TransferCanceller {
    state: std::sync::Weak<Mutex<TransferState>>,
}

impl TransferCanceller {
    pub fn cancel(&self) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).cancelled = true;
        }
    }
}
