//! Incremental indexing pipeline: symbol diffing, chunking and the
//! coordinator that drives cache, worker pool and storage for each file.

pub mod analyzer;
pub mod chunker;
pub mod coordinator;
pub mod error;
pub mod memory_storage;
pub mod report;

pub use analyzer::{ChangeAnalyzer, DiffResult, FullReindexReason};
pub use chunker::SymbolChunker;
pub use coordinator::IndexingCoordinator;
pub use error::{ErrorKind, IndexError, Result};
pub use memory_storage::{MemoryStorage, MemoryTransaction, StoredChunk};
pub use report::{BatchReport, CoordinatorStats, FileFailure, FileIndexReport, WriteMode};
