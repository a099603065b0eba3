use crate::task::{ParseTask, TaskHandle, TaskId, TaskInput, TaskResult};
use crate::worker::{Job, WorkerEvent, WorkerId, WorkerSlot, WorkerState};
use crate::QueueError;
use codegraph_core::{ContentHash, PoolConfig, SourceParser};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub crashed: u64,
    pub deduplicated: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct PoolCounters {
    workers: AtomicUsize,
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    crashed: AtomicU64,
    deduplicated: AtomicU64,
    cancelled: AtomicU64,
}

impl PoolCounters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            workers: self.workers.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            crashed: self.crashed.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Submit {
        task: ParseTask,
        reply: oneshot::Sender<TaskResult>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Fixed-size pool of isolated parse workers.
///
/// Tasks run in FIFO order. A task that exceeds its timeout, or whose
/// worker panics, resolves with `Timeout` / `Crashed` and the worker is
/// replaced so capacity stays constant. Submissions for a (path, content)
/// pair that is already queued or running share the in-flight task.
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    counters: Arc<PoolCounters>,
    config: PoolConfig,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `config.worker_count` workers. Must be called inside a Tokio runtime.
    pub fn new(config: &PoolConfig, parser: Arc<dyn SourceParser>) -> Result<Self, QueueError> {
        let worker_count = config.worker_count.max(1);
        let counters = Arc::new(PoolCounters::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let mut supervisor = Supervisor {
            parser,
            events_tx,
            counters: counters.clone(),
            workers: HashMap::new(),
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            tasks: HashMap::new(),
            in_flight: HashMap::new(),
            timers: HashMap::new(),
            next_worker_id: 0,
        };

        for _ in 0..worker_count {
            supervisor
                .start_worker()
                .map_err(|e| QueueError::WorkerSpawn(e.to_string()))?;
        }

        info!("Started parse worker pool with {} workers", worker_count);
        let handle = tokio::spawn(supervisor.run(commands_rx, events_rx));

        Ok(Self {
            commands: commands_tx,
            counters,
            config: PoolConfig {
                worker_count,
                ..config.clone()
            },
            supervisor: Mutex::new(Some(handle)),
        })
    }

    /// Queues a parse. The returned handle resolves once the task completes,
    /// times out, crashes its worker or is cancelled by shutdown.
    pub fn submit(&self, input: TaskInput) -> Result<TaskHandle, QueueError> {
        let id = Uuid::new_v4();
        let task = ParseTask::new(id, input, self.config.task_timeout());
        let (reply, rx) = oneshot::channel();

        self.commands
            .send(Command::Submit { task, reply })
            .map_err(|_| QueueError::PoolShutdown)?;
        counter!("parse_tasks_submitted").increment(1);

        Ok(TaskHandle::new(id, rx))
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.commands.is_closed()
    }

    /// Cancels outstanding tasks and stops the workers. Safe to call twice.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
        if let Some(handle) = self.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Worker pool supervisor failed: {}", e);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.supervisor.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

struct PendingTask {
    task: ParseTask,
    waiters: Vec<oneshot::Sender<TaskResult>>,
}

struct Supervisor {
    parser: Arc<dyn SourceParser>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    counters: Arc<PoolCounters>,
    workers: HashMap<WorkerId, WorkerSlot>,
    idle: VecDeque<WorkerId>,
    queue: VecDeque<TaskId>,
    tasks: HashMap<TaskId, PendingTask>,
    in_flight: HashMap<(String, ContentHash), TaskId>,
    timers: HashMap<TaskId, JoinHandle<()>>,
    next_worker_id: WorkerId,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Submit { task, reply }) => self.enqueue(task, reply),
                    Some(Command::Shutdown { ack }) => {
                        commands.close();
                        self.stop().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
            self.dispatch();
        }
        info!("Parse worker pool stopped");
    }

    fn start_worker(&mut self) -> std::io::Result<WorkerId> {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let slot = WorkerSlot::spawn(id, self.parser.clone(), self.events_tx.clone())?;
        self.workers.insert(id, slot);
        self.idle.push_back(id);
        self.counters.workers.store(self.workers.len(), Ordering::Relaxed);
        gauge!("parse_workers").set(self.workers.len() as f64);
        Ok(id)
    }

    fn enqueue(&mut self, task: ParseTask, reply: oneshot::Sender<TaskResult>) {
        let key = task.dedup_key();
        if let Some(existing) = self.in_flight.get(&key) {
            if let Some(pending) = self.tasks.get_mut(existing) {
                debug!(
                    "Joining in-flight parse of {} ({})",
                    key.0, task.content_hash
                );
                pending.waiters.push(reply);
                self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                counter!("parse_tasks_deduplicated").increment(1);
                return;
            }
        }

        if self.workers.is_empty() {
            if let Err(e) = self.start_worker() {
                error!("Cannot start parse worker: {}", e);
                let _ = reply.send(TaskResult::Unavailable(e.to_string()));
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let id = task.id;
        self.in_flight.insert(key, id);
        self.tasks.insert(
            id,
            PendingTask {
                task,
                waiters: vec![reply],
            },
        );
        self.queue.push_back(id);
        self.update_queue_gauges();
    }

    fn dispatch(&mut self) {
        while !self.queue.is_empty() {
            let Some(worker_id) = self.idle.pop_front() else {
                break;
            };
            let Some(task_id) = self.queue.pop_front() else {
                break;
            };
            let Some(pending) = self.tasks.get(&task_id) else {
                self.idle.push_front(worker_id);
                continue;
            };
            let Some(slot) = self.workers.get_mut(&worker_id) else {
                self.queue.push_front(task_id);
                continue;
            };

            let job = Job {
                task_id,
                file_path: pending.task.input.file_path.clone(),
                content: pending.task.input.content.clone(),
            };
            let timeout = pending.task.timeout;

            if slot.dispatch(job).is_err() {
                warn!("Parse worker {} is gone; replacing it", worker_id);
                self.queue.push_front(task_id);
                self.retire_worker(worker_id);
                continue;
            }

            debug!("Dispatched task {} to worker {}", task_id, worker_id);
            let events = self.events_tx.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(WorkerEvent::TimedOut { worker_id, task_id });
            });
            self.timers.insert(task_id, timer);
            self.counters.active.fetch_add(1, Ordering::Relaxed);
        }
        self.update_queue_gauges();
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Finished {
                worker_id,
                task_id,
                result,
                elapsed,
            } => {
                if !self.owns(worker_id, task_id) {
                    debug!(
                        "Dropping late result of task {} from retired worker {}",
                        task_id, worker_id
                    );
                    return;
                }
                if let Some(slot) = self.workers.get_mut(&worker_id) {
                    slot.state = WorkerState::Idle;
                }
                self.idle.push_back(worker_id);
                histogram!("parse_task_duration").record(elapsed.as_secs_f64());

                let outcome = match result {
                    Ok(parsed) => {
                        self.counters.completed.fetch_add(1, Ordering::Relaxed);
                        counter!("parse_tasks_completed").increment(1);
                        TaskResult::Ok(Arc::new(parsed))
                    }
                    Err(e) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        counter!("parse_tasks_failed").increment(1);
                        TaskResult::ParseError(e)
                    }
                };
                self.finish(task_id, outcome);
            }
            WorkerEvent::Crashed {
                worker_id,
                task_id,
                reason,
            } => {
                if !self.owns(worker_id, task_id) {
                    return;
                }
                error!("Parse worker {} crashed: {}", worker_id, reason);
                self.counters.crashed.fetch_add(1, Ordering::Relaxed);
                counter!("parse_workers_crashed").increment(1);
                self.retire_worker(worker_id);
                self.finish(task_id, TaskResult::Crashed(reason));
            }
            WorkerEvent::TimedOut { worker_id, task_id } => {
                if !self.owns(worker_id, task_id) {
                    return;
                }
                let path = self
                    .tasks
                    .get(&task_id)
                    .map(|p| p.task.input.file_path.clone())
                    .unwrap_or_default();
                warn!(
                    "Parse of {} timed out on worker {}; replacing worker",
                    path, worker_id
                );
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                counter!("parse_tasks_timed_out").increment(1);
                self.retire_worker(worker_id);
                self.finish(task_id, TaskResult::Timeout);
            }
        }
    }

    fn owns(&self, worker_id: WorkerId, task_id: TaskId) -> bool {
        self.workers
            .get(&worker_id)
            .map(|slot| slot.is_running(task_id))
            .unwrap_or(false)
    }

    /// Detaches a worker and starts a replacement in its place.
    fn retire_worker(&mut self, worker_id: WorkerId) {
        if let Some(mut slot) = self.workers.remove(&worker_id) {
            slot.state = WorkerState::Crashed;
            slot.detach();
        }
        self.idle.retain(|id| *id != worker_id);

        match self.start_worker() {
            Ok(id) => debug!("Worker {} replaced by {}", worker_id, id),
            Err(e) => {
                error!("Failed to start replacement worker: {}", e);
                self.counters
                    .workers
                    .store(self.workers.len(), Ordering::Relaxed);
                if self.workers.is_empty() {
                    let reason = e.to_string();
                    while let Some(task_id) = self.queue.pop_front() {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        self.resolve(task_id, TaskResult::Unavailable(reason.clone()));
                    }
                }
            }
        }
    }

    fn finish(&mut self, task_id: TaskId, outcome: TaskResult) {
        if let Some(timer) = self.timers.remove(&task_id) {
            timer.abort();
        }
        self.counters.active.fetch_sub(1, Ordering::Relaxed);
        self.resolve(task_id, outcome);
    }

    fn resolve(&mut self, task_id: TaskId, outcome: TaskResult) {
        if let Some(pending) = self.tasks.remove(&task_id) {
            let key = pending.task.dedup_key();
            if self.in_flight.get(&key) == Some(&task_id) {
                self.in_flight.remove(&key);
            }
            for waiter in pending.waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    async fn stop(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }

        let outstanding: Vec<TaskId> = self.tasks.keys().copied().collect();
        let cancelled = outstanding.len() as u64;
        for task_id in outstanding {
            self.resolve(task_id, TaskResult::Cancelled);
        }
        self.queue.clear();
        self.counters.cancelled.fetch_add(cancelled, Ordering::Relaxed);
        self.counters.active.store(0, Ordering::Relaxed);

        let mut joinable = Vec::new();
        for (id, slot) in self.workers.drain() {
            if self.idle.contains(&id) {
                joinable.extend(slot.close());
            } else {
                slot.detach();
            }
        }
        self.idle.clear();
        self.counters.workers.store(0, Ordering::Relaxed);
        self.update_queue_gauges();

        let joined = tokio::task::spawn_blocking(move || {
            for handle in joinable {
                let _ = handle.join();
            }
        })
        .await;
        if let Err(e) = joined {
            warn!("Failed to join parse workers: {}", e);
        }
        info!("Cancelled {} outstanding parse tasks", cancelled);
    }

    fn update_queue_gauges(&self) {
        self.counters
            .queued
            .store(self.queue.len(), Ordering::Relaxed);
        gauge!("parse_queue_depth").set(self.queue.len() as f64);
        gauge!("parse_tasks_active").set(self.counters.active.load(Ordering::Relaxed) as f64);
    }
}
