//! Error types for the streaming pipeline

use thiserror::Error;

use crate::core::types::ResourceId;

/// Main error type for the crate
#[derive(Debug, Error)]
pub enum Error {
    #[error("Storage read failed (file {file_id}, offset {offset}): {source}")]
    StorageReadFailure {
        file_id: u32,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Incomplete generation: {0}")]
    IncompleteGeneration(String),

    #[error("Generation instance invalidated")]
    InstanceInvalidated,

    /// Not a failure. Requests that observe it unwind silently.
    #[error("Request cancelled")]
    Cancelled,

    #[error("Resource {0} already has an active streaming request")]
    AlreadyInFlight(ResourceId),

    #[error("Block transfer already streamed")]
    TransferAlreadyStreamed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Scheduler shut down")]
    SchedulerShutdown,

    #[error("Generation error: {0}")]
    Generation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
