use crate::task::TaskId;
use codegraph_core::{ParseResult, ParserError, SourceParser};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

pub type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy(TaskId),
    Crashed,
}

pub(crate) struct Job {
    pub task_id: TaskId,
    pub file_path: String,
    pub content: Arc<str>,
}

pub(crate) enum WorkerEvent {
    Finished {
        worker_id: WorkerId,
        task_id: TaskId,
        result: Result<ParseResult, ParserError>,
        elapsed: Duration,
    },
    Crashed {
        worker_id: WorkerId,
        task_id: TaskId,
        reason: String,
    },
    TimedOut {
        worker_id: WorkerId,
        task_id: TaskId,
    },
}

/// A parser running on its own OS thread.
///
/// The supervisor only ever hands a job to an idle worker, so the
/// single-slot job channel never blocks.
pub(crate) struct WorkerSlot {
    id: WorkerId,
    pub state: WorkerState,
    jobs: Sender<Job>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerSlot {
    pub fn spawn(
        id: WorkerId,
        parser: Arc<dyn SourceParser>,
        events: UnboundedSender<WorkerEvent>,
    ) -> std::io::Result<Self> {
        let (jobs, inbox) = crossbeam_channel::bounded::<Job>(1);
        let thread = std::thread::Builder::new()
            .name(format!("parse-worker-{}", id))
            .spawn(move || run_worker(id, parser, inbox, events))?;

        debug!("Started parse worker {}", id);
        Ok(Self {
            id,
            state: WorkerState::Idle,
            jobs,
            thread: Some(thread),
        })
    }

    /// Hands the job back if the worker thread is gone.
    pub fn dispatch(&mut self, job: Job) -> Result<(), Job> {
        let task_id = job.task_id;
        match self.jobs.try_send(job) {
            Ok(()) => {
                self.state = WorkerState::Busy(task_id);
                Ok(())
            }
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => {
                self.state = WorkerState::Crashed;
                Err(job)
            }
        }
    }

    pub fn is_running(&self, task_id: TaskId) -> bool {
        self.state == WorkerState::Busy(task_id)
    }

    /// Drops the job channel without waiting for the thread. A worker stuck
    /// in a parse exits on its own once the parse returns.
    pub fn detach(mut self) {
        debug!("Detaching parse worker {} ({:?})", self.id, self.state);
        self.thread.take();
    }

    /// Closes the job channel and hands back the thread for joining.
    pub fn close(mut self) -> Option<JoinHandle<()>> {
        debug!("Closing parse worker {}", self.id);
        self.thread.take()
    }
}

fn run_worker(
    worker_id: WorkerId,
    parser: Arc<dyn SourceParser>,
    inbox: Receiver<Job>,
    events: UnboundedSender<WorkerEvent>,
) {
    while let Ok(job) = inbox.recv() {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            parser.parse(&job.content, &job.file_path)
        }));

        match outcome {
            Ok(result) => {
                let event = WorkerEvent::Finished {
                    worker_id,
                    task_id: job.task_id,
                    result,
                    elapsed: started.elapsed(),
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                warn!(
                    "Parse worker {} panicked on {}: {}",
                    worker_id, job.file_path, reason
                );
                let _ = events.send(WorkerEvent::Crashed {
                    worker_id,
                    task_id: job.task_id,
                    reason,
                });
                break;
            }
        }
    }
    debug!("Parse worker {} exiting", worker_id);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}
