//! Preload scheduler: priority queue with bounded concurrency
//!
//! A single coordinator task owns the queue, the running set, and the
//! bounded history; handles talk to it over a command channel, so every
//! state transition is serialized. Downloads themselves run in spawned
//! worker tasks that delegate to the resource's loader and report back
//! through the same channel.
//!
//! Ordering is `(priority desc, created_at asc)` with binary-search
//! insertion. Dispatch fills free slots whenever the queue grows or the
//! running set shrinks. Dynamic aging bumps starved tasks one priority
//! level before each dispatch.

use crate::cache::CacheStatistics;
use crate::error::{CacheError, Result};
use crate::loader::LoaderRegistry;
use crate::preload::task::{PreloadTask, TaskId, TaskState};
use crate::types::{now_millis, ResourcePriority};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Scheduler tunables
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrently running tasks
    pub max_concurrent: usize,

    /// Maximum tasks started per dispatch round
    pub batch_size: usize,

    /// Retries per task before it fails terminally
    pub max_retries: u32,

    /// Base of the retry sleep: `initial * 2^retry_count` seconds
    pub retry_initial_secs: u64,

    /// Whether starved tasks get their priority bumped
    pub dynamic_aging_enabled: bool,

    /// Age after which a queued task is bumped one level
    pub aging_threshold: Duration,

    /// Terminal tasks kept for inspection
    pub history_limit: usize,

    /// Per-task timeout
    pub task_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            batch_size: 3,
            max_retries: 3,
            retry_initial_secs: 1,
            dynamic_aging_enabled: true,
            aging_threshold: Duration::from_secs(30),
            history_limit: 100,
            task_timeout: Duration::from_secs(300),
        }
    }
}

impl SchedulerConfig {
    /// Validate tunables
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(CacheError::Config(
                "max_concurrent must be >= 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(CacheError::Config("batch_size must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Terminal counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerCounters {
    /// Tasks ever enqueued
    pub created: u64,
    /// Tasks that completed
    pub completed: u64,
    /// Tasks that failed terminally
    pub failed: u64,
    /// Tasks that were cancelled
    pub cancelled: u64,
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    /// Tasks waiting for a slot, in dispatch order
    pub queued: Vec<PreloadTask>,
    /// Tasks currently downloading
    pub running: Vec<PreloadTask>,
    /// Parked tasks
    pub paused: Vec<PreloadTask>,
    /// Recent terminal tasks, oldest first
    pub history: Vec<PreloadTask>,
    /// Terminal counters
    pub counters: SchedulerCounters,
}

enum Command {
    Add {
        url: String,
        length: Option<i64>,
        priority: ResourcePriority,
        reply: oneshot::Sender<TaskId>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    CancelAll,
    Pause {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Resume {
        id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Finished {
        id: TaskId,
        outcome: TaskOutcome,
        retry_count: u32,
    },
    Shutdown,
}

#[derive(Debug)]
enum TaskOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

/// Handle to the scheduler coordinator
#[derive(Clone)]
pub struct PreloadScheduler {
    commands: mpsc::UnboundedSender<Command>,
}

impl PreloadScheduler {
    /// Spawn the coordinator
    pub fn spawn(
        config: SchedulerConfig,
        registry: Arc<LoaderRegistry>,
        stats: Arc<CacheStatistics>,
    ) -> Result<Self> {
        config.validate()?;
        let (commands, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            config,
            registry,
            stats,
            internal: commands.clone(),
            queued: Vec::new(),
            paused: Vec::new(),
            running: HashMap::new(),
            history: VecDeque::new(),
            counters: SchedulerCounters::default(),
        };
        tokio::spawn(coordinator.run(rx));
        Ok(Self { commands })
    }

    /// Enqueue a preload of the first `length` bytes of `url`
    pub async fn add(
        &self,
        url: &str,
        length: Option<i64>,
        priority: ResourcePriority,
    ) -> Result<TaskId> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Add {
                url: url.to_string(),
                length,
                priority,
                reply,
            })
            .map_err(|_| CacheError::ChannelClosed("scheduler gone".to_string()))?;
        rx.await
            .map_err(|_| CacheError::ChannelClosed("scheduler gone".to_string()))
    }

    /// Cancel a task; `true` iff it was still queued, running, or paused
    pub async fn cancel(&self, id: TaskId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Cancel { id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Cancel every non-terminal task
    pub fn cancel_all(&self) {
        let _ = self.commands.send(Command::CancelAll);
    }

    /// Pause a queued or running task
    pub async fn pause(&self, id: TaskId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Pause { id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Return a paused task to the queue
    pub async fn resume(&self, id: TaskId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Resume { id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Current queue, running set, history, and counters
    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .map_err(|_| CacheError::ChannelClosed("scheduler gone".to_string()))?;
        rx.await
            .map_err(|_| CacheError::ChannelClosed("scheduler gone".to_string()))
    }

    /// Cancel everything and stop the coordinator
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct QueuedEntry {
    task: PreloadTask,
    /// Last time aging bumped this task, unix millis
    aged_at: Option<i64>,
}

struct RunningEntry {
    task: PreloadTask,
    cancel: Option<oneshot::Sender<()>>,
    pause_pending: bool,
}

struct Coordinator {
    config: SchedulerConfig,
    registry: Arc<LoaderRegistry>,
    stats: Arc<CacheStatistics>,
    internal: mpsc::UnboundedSender<Command>,
    queued: Vec<QueuedEntry>,
    paused: Vec<PreloadTask>,
    running: HashMap<TaskId, RunningEntry>,
    history: VecDeque<PreloadTask>,
    counters: SchedulerCounters,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        debug!("preload scheduler started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Add {
                    url,
                    length,
                    priority,
                    reply,
                } => {
                    let id = self.enqueue(url, length, priority);
                    let _ = reply.send(id);
                    self.dispatch();
                }
                Command::Cancel { id, reply } => {
                    let _ = reply.send(self.cancel(id));
                    self.dispatch();
                }
                Command::CancelAll => {
                    self.cancel_everything();
                }
                Command::Pause { id, reply } => {
                    let _ = reply.send(self.pause(id));
                }
                Command::Resume { id, reply } => {
                    let _ = reply.send(self.resume(id));
                    self.dispatch();
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::Finished {
                    id,
                    outcome,
                    retry_count,
                } => {
                    self.finish(id, outcome, retry_count);
                    self.dispatch();
                }
                Command::Shutdown => {
                    self.cancel_everything();
                    break;
                }
            }
        }
        debug!("preload scheduler stopped");
    }

    fn enqueue(
        &mut self,
        url: String,
        length: Option<i64>,
        priority: ResourcePriority,
    ) -> TaskId {
        let key = self.registry.key_for(&url);
        let task = PreloadTask::new(
            url,
            key,
            length,
            priority,
            self.config.task_timeout.as_secs(),
        );
        let id = task.id;
        self.counters.created += 1;
        info!(task = %id, url = %task.url, ?priority, "preload queued");
        self.insert_queued(task);
        id
    }

    /// Binary-search insertion keeping `(priority desc, created_at asc)`
    fn insert_queued(&mut self, task: PreloadTask) {
        let pos = self.queued.partition_point(|e| {
            e.task.priority > task.priority
                || (e.task.priority == task.priority && e.task.created_at <= task.created_at)
        });
        self.queued.insert(
            pos,
            QueuedEntry {
                task,
                aged_at: None,
            },
        );
    }

    /// Bump starved queued tasks one level, then re-sort
    fn apply_aging(&mut self) {
        if !self.config.dynamic_aging_enabled {
            return;
        }
        let now = now_millis();
        let threshold = self.config.aging_threshold.as_millis() as i64;
        let mut bumped = false;
        for entry in &mut self.queued {
            let since = now - entry.aged_at.unwrap_or(entry.task.created_at);
            let next = entry.task.priority.bumped();
            if since > threshold && next != entry.task.priority {
                debug!(task = %entry.task.id, from = ?entry.task.priority, to = ?next, "aging bump");
                entry.task.priority = next;
                entry.aged_at = Some(now);
                bumped = true;
            }
        }
        if bumped {
            self.queued
                .sort_by(|a, b| match b.task.priority.cmp(&a.task.priority) {
                    std::cmp::Ordering::Equal => a.task.created_at.cmp(&b.task.created_at),
                    other => other,
                });
        }
    }

    /// Start tasks from the head of the queue while slots are free
    fn dispatch(&mut self) {
        self.apply_aging();
        let free = self
            .config
            .max_concurrent
            .saturating_sub(self.running.len())
            .min(self.config.batch_size);
        for _ in 0..free {
            if self.queued.is_empty() {
                break;
            }
            let entry = self.queued.remove(0);
            self.start(entry.task);
        }
    }

    fn start(&mut self, mut task: PreloadTask) {
        task.state = TaskState::Running;
        task.started_at = Some(now_millis());
        info!(task = %task.id, url = %task.url, "preload started");

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let worker = Worker {
            registry: Arc::clone(&self.registry),
            internal: self.internal.clone(),
            id: task.id,
            url: task.url.clone(),
            length: task.length,
            priority: task.priority,
            timeout: self.config.task_timeout,
            max_retries: self.config.max_retries,
            retry_initial_secs: self.config.retry_initial_secs,
        };
        tokio::spawn(worker.run(cancel_rx));

        self.running.insert(
            task.id,
            RunningEntry {
                task,
                cancel: Some(cancel_tx),
                pause_pending: false,
            },
        );
    }

    fn cancel(&mut self, id: TaskId) -> bool {
        if let Some(pos) = self.queued.iter().position(|e| e.task.id == id) {
            let entry = self.queued.remove(pos);
            self.finalize(entry.task, TaskState::Cancelled);
            return true;
        }
        if let Some(entry) = self.running.get_mut(&id) {
            entry.pause_pending = false;
            if let Some(cancel) = entry.cancel.take() {
                let _ = cancel.send(());
            }
            return true;
        }
        if let Some(pos) = self.paused.iter().position(|t| t.id == id) {
            let task = self.paused.remove(pos);
            self.finalize(task, TaskState::Cancelled);
            return true;
        }
        false
    }

    fn cancel_everything(&mut self) {
        let queued: Vec<_> = self.queued.drain(..).collect();
        for entry in queued {
            self.finalize(entry.task, TaskState::Cancelled);
        }
        let paused: Vec<_> = self.paused.drain(..).collect();
        for task in paused {
            self.finalize(task, TaskState::Cancelled);
        }
        for entry in self.running.values_mut() {
            entry.pause_pending = false;
            if let Some(cancel) = entry.cancel.take() {
                let _ = cancel.send(());
            }
        }
    }

    fn pause(&mut self, id: TaskId) -> bool {
        if let Some(pos) = self.queued.iter().position(|e| e.task.id == id) {
            let mut entry = self.queued.remove(pos);
            entry.task.state = TaskState::Paused;
            self.paused.push(entry.task);
            return true;
        }
        if let Some(entry) = self.running.get_mut(&id) {
            // The session is cancelled but the partial cache survives; the
            // completion report parks the task instead of finalizing it.
            entry.pause_pending = true;
            if let Some(cancel) = entry.cancel.take() {
                let _ = cancel.send(());
            }
            return true;
        }
        false
    }

    fn resume(&mut self, id: TaskId) -> bool {
        if let Some(pos) = self.paused.iter().position(|t| t.id == id) {
            let mut task = self.paused.remove(pos);
            task.state = TaskState::Queued;
            task.started_at = None;
            self.insert_queued(task);
            return true;
        }
        false
    }

    fn finish(&mut self, id: TaskId, outcome: TaskOutcome, retry_count: u32) {
        let Some(entry) = self.running.remove(&id) else {
            return;
        };
        let mut task = entry.task;
        task.retry_count = retry_count;

        if entry.pause_pending && matches!(outcome, TaskOutcome::Cancelled) {
            task.state = TaskState::Paused;
            task.started_at = None;
            self.paused.push(task);
            return;
        }

        let state = match outcome {
            TaskOutcome::Completed => TaskState::Completed,
            TaskOutcome::Cancelled => TaskState::Cancelled,
            TaskOutcome::Failed(reason) => TaskState::Failed(reason),
        };
        self.finalize(task, state);
    }

    fn finalize(&mut self, mut task: PreloadTask, state: TaskState) {
        task.ended_at = Some(now_millis());
        match &state {
            TaskState::Completed => {
                self.counters.completed += 1;
                self.stats.record_preload_outcome(true, false);
                info!(task = %task.id, "preload completed");
            }
            TaskState::Cancelled => {
                self.counters.cancelled += 1;
                self.stats.record_preload_outcome(false, true);
                info!(task = %task.id, "preload cancelled");
            }
            TaskState::Failed(reason) => {
                self.counters.failed += 1;
                self.stats.record_preload_outcome(false, false);
                warn!(task = %task.id, reason = %reason, "preload failed");
            }
            _ => {}
        }
        task.state = state;
        self.history.push_back(task);
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            queued: self.queued.iter().map(|e| e.task.clone()).collect(),
            running: self.running.values().map(|e| e.task.clone()).collect(),
            paused: self.paused.clone(),
            history: self.history.iter().cloned().collect(),
            counters: self.counters,
        }
    }
}

/// One running download, delegating to the resource's loader
struct Worker {
    registry: Arc<LoaderRegistry>,
    internal: mpsc::UnboundedSender<Command>,
    id: TaskId,
    url: String,
    length: Option<i64>,
    priority: ResourcePriority,
    timeout: Duration,
    max_retries: u32,
    retry_initial_secs: u64,
}

impl Worker {
    async fn run(self, mut cancel_rx: oneshot::Receiver<()>) {
        let mut retry_count: u32 = 0;
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            let (key, ticket) = match self
                .registry
                .preload(&self.url, self.length, self.priority)
                .await
            {
                Ok(attached) => attached,
                Err(e) => break TaskOutcome::Failed(e.to_string()),
            };

            let attempt = tokio::select! {
                result = ticket.done => match result {
                    Ok(result) => result,
                    Err(_) => Err(CacheError::ChannelClosed("loader gone".to_string())),
                },
                _ = &mut cancel_rx => {
                    self.registry.cancel_preload(&key, ticket.id);
                    break TaskOutcome::Cancelled;
                }
                _ = &mut deadline => {
                    self.registry.cancel_preload(&key, ticket.id);
                    break TaskOutcome::Failed(format!(
                        "timed out after {:?}",
                        self.timeout
                    ));
                }
            };

            match attempt {
                Ok(()) => break TaskOutcome::Completed,
                Err(e) if e.is_cancelled() => break TaskOutcome::Cancelled,
                Err(e) if e.is_retriable() && retry_count < self.max_retries => {
                    let delay = Duration::from_secs(
                        self.retry_initial_secs.saturating_mul(1u64 << retry_count.min(16)),
                    );
                    retry_count += 1;
                    debug!(task = %self.id, retry = retry_count, delay_secs = delay.as_secs(), "preload retry");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut cancel_rx => break TaskOutcome::Cancelled,
                        _ = &mut deadline => break TaskOutcome::Failed(format!(
                            "timed out after {:?}",
                            self.timeout
                        )),
                    }
                }
                Err(e) => break TaskOutcome::Failed(e.to_string()),
            }
        };

        let _ = self.internal.send(Command::Finished {
            id: self.id,
            outcome,
            retry_count,
        });
    }
}
