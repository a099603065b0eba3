use crate::report::WriteMode;
use codegraph_core::CodeGraphError;
use codegraph_queue::QueueError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-file indexing failure.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to parse {path} after {attempts} attempt(s): {source}")]
    ParseFailure {
        path: String,
        attempts: u32,
        #[source]
        source: QueueError,
    },

    #[error("Failed to write {path} ({mode} mode): {source}")]
    StorageWriteFailure {
        path: String,
        mode: WriteMode,
        #[source]
        source: CodeGraphError,
    },

    #[error("Failed to read stored state of {path}: {source}")]
    StorageRead {
        path: String,
        #[source]
        source: CodeGraphError,
    },

    #[error("{0} is already being indexed")]
    PathBusy(String),
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// Flat classification of [`IndexError`] for reports and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ParseFailure,
    WorkerTimeout,
    WorkerCrashed,
    PoolShutdown,
    StorageWriteFailure,
    StorageRead,
    PathBusy,
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::ParseFailure { source, .. } => match source {
                QueueError::Timeout => ErrorKind::WorkerTimeout,
                QueueError::WorkerCrashed(_) => ErrorKind::WorkerCrashed,
                QueueError::PoolShutdown => ErrorKind::PoolShutdown,
                QueueError::Parse(_) | QueueError::WorkerSpawn(_) => ErrorKind::ParseFailure,
            },
            IndexError::StorageWriteFailure { .. } => ErrorKind::StorageWriteFailure,
            IndexError::StorageRead { .. } => ErrorKind::StorageRead,
            IndexError::PathBusy(_) => ErrorKind::PathBusy,
        }
    }

    /// Whether indexing the same content again may succeed. A parser that
    /// rejected the content will reject it again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            IndexError::ParseFailure {
                source: QueueError::Parse(_),
                ..
            }
        ) && self.kind() != ErrorKind::PoolShutdown
    }

    pub fn path(&self) -> &str {
        match self {
            IndexError::ParseFailure { path, .. }
            | IndexError::StorageWriteFailure { path, .. }
            | IndexError::StorageRead { path, .. }
            | IndexError::PathBusy(path) => path,
        }
    }
}
