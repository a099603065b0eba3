//! Isolated parse workers with per-task timeouts, crash recovery and
//! in-flight de-duplication.

pub mod error;
pub mod pool;
pub mod task;
pub mod worker;

pub use error::QueueError;
pub use pool::{PoolStats, WorkerPool};
pub use task::{ParseTask, TaskHandle, TaskId, TaskInput, TaskResult};
pub use worker::{WorkerId, WorkerState};
