use crate::QueueError;
use chrono::{DateTime, Utc};
use codegraph_core::{ContentHash, ParseResult, ParserError};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

pub type TaskId = Uuid;

/// What a worker needs to parse one file revision.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub file_path: String,
    pub content: Arc<str>,
}

impl TaskInput {
    pub fn new(file_path: impl Into<String>, content: impl Into<Arc<str>>) -> Self {
        Self {
            file_path: file_path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParseTask {
    pub id: TaskId,
    pub input: TaskInput,
    pub content_hash: ContentHash,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
}

impl ParseTask {
    pub fn new(id: TaskId, input: TaskInput, timeout: Duration) -> Self {
        let content_hash = ContentHash::of(&input.content);
        Self {
            id,
            input,
            content_hash,
            timeout,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn dedup_key(&self) -> (String, ContentHash) {
        (self.input.file_path.clone(), self.content_hash)
    }
}

/// Outcome of a parse task as decoded at the pool boundary.
#[derive(Debug, Clone)]
pub enum TaskResult {
    Ok(Arc<ParseResult>),
    ParseError(ParserError),
    Timeout,
    Crashed(String),
    /// No worker could be started to run the task.
    Unavailable(String),
    /// The pool shut down before the task finished.
    Cancelled,
}

impl TaskResult {
    pub fn into_result(self) -> Result<Arc<ParseResult>, QueueError> {
        match self {
            TaskResult::Ok(result) => Ok(result),
            TaskResult::ParseError(e) => Err(QueueError::Parse(e)),
            TaskResult::Timeout => Err(QueueError::Timeout),
            TaskResult::Crashed(reason) => Err(QueueError::WorkerCrashed(reason)),
            TaskResult::Unavailable(reason) => Err(QueueError::WorkerSpawn(reason)),
            TaskResult::Cancelled => Err(QueueError::PoolShutdown),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, TaskResult::Ok(_))
    }
}

/// Resolves to the [`TaskResult`] of a submitted parse.
///
/// Dropping the handle does not cancel the task; its result is discarded.
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    rx: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId, rx: oneshot::Receiver<TaskResult>) -> Self {
        Self { id, rx }
    }

    pub fn task_id(&self) -> TaskId {
        self.id
    }
}

impl Future for TaskHandle {
    type Output = TaskResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|received| received.unwrap_or(TaskResult::Cancelled))
    }
}
