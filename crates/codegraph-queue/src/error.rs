use codegraph_core::ParserError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Parse task timed out")]
    Timeout,

    #[error("Worker crashed while parsing: {0}")]
    WorkerCrashed(String),

    #[error(transparent)]
    Parse(#[from] ParserError),

    #[error("Failed to start parse worker: {0}")]
    WorkerSpawn(String),

    #[error("Worker pool is shut down")]
    PoolShutdown,
}

impl QueueError {
    /// Timeouts and crashes say nothing about the input; a fresh worker may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Timeout | QueueError::WorkerCrashed(_))
    }
}
