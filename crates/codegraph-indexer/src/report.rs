use crate::analyzer::FullReindexReason;
use crate::error::{ErrorKind, IndexError};
use codegraph_cache::CacheStats;
use codegraph_queue::PoolStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// How a file's rows were written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteMode {
    Full,
    Incremental,
    /// Stored content already matches; nothing was written.
    Skipped,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Full => write!(f, "full"),
            WriteMode::Incremental => write!(f, "incremental"),
            WriteMode::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileIndexReport {
    pub path: String,
    pub mode: WriteMode,
    pub cache_hit: bool,
    pub parse_attempts: u32,
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub chunks_written: usize,
    pub full_reindex_reason: Option<FullReindexReason>,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct FileFailure {
    pub path: String,
    pub kind: ErrorKind,
    pub error: IndexError,
}

impl From<IndexError> for FileFailure {
    fn from(error: IndexError) -> Self {
        Self {
            path: error.path().to_string(),
            kind: error.kind(),
            error,
        }
    }
}

/// Outcome of [`crate::IndexingCoordinator::index_batch`]; successes and
/// failures are listed separately.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<FileIndexReport>,
    pub failed: Vec<FileFailure>,
    pub duration: Duration,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failure(&self, path: &str) -> Option<&FileFailure> {
        self.failed.iter().find(|f| f.path == path)
    }

    pub fn report(&self, path: &str) -> Option<&FileIndexReport> {
        self.succeeded.iter().find(|r| r.path == path)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub cache: CacheStats,
    pub pool: PoolStats,
    pub files_indexed: u64,
    pub files_failed: u64,
    pub full_writes: u64,
    pub incremental_writes: u64,
    pub skipped: u64,
}
