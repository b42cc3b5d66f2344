use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::events::AbandonReason;
use crate::runtime::ShutdownToken;
use crate::task::{ChainId, Task, TaskId, TaskKind, TaskStatus};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Degraded,
}

impl EngineStatus {
    /// Label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Starting => "starting",
            EngineStatus::Running => "running",
            EngineStatus::Stopping => "stopping",
            EngineStatus::Stopped => "stopped",
            EngineStatus::Degraded => "degraded",
        }
    }

    /// Whether the engine still accepts submissions.
    pub fn accepts_work(&self) -> bool {
        !matches!(self, EngineStatus::Stopping | EngineStatus::Stopped)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of the engine's counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub status: EngineStatus,
    /// Every task ever created: chain heads, successors and follow-ups.
    pub tasks_total: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_abandoned: u64,
    /// Tasks currently waiting out a retry backoff.
    pub tasks_retrying: u64,
    /// Submissions merged into an existing task instead of creating one.
    pub tasks_coalesced: u64,
    /// Tasks still executing when the stop deadline elapsed.
    pub tasks_running_at_shutdown: u64,
    pub queue_depth: u64,
    pub workers_busy: u64,
    pub chains_completed: u64,
    pub chains_failed: u64,
    pub completed_by_kind: BTreeMap<TaskKind, u64>,
    /// Indexed documents per lowercase file extension.
    pub extensions: BTreeMap<String, u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            status: EngineStatus::Starting,
            tasks_total: 0,
            tasks_completed: 0,
            tasks_failed: 0,
            tasks_abandoned: 0,
            tasks_retrying: 0,
            tasks_coalesced: 0,
            tasks_running_at_shutdown: 0,
            queue_depth: 0,
            workers_busy: 0,
            chains_completed: 0,
            chains_failed: 0,
            completed_by_kind: BTreeMap::new(),
            extensions: BTreeMap::new(),
            started_at: None,
            stopped_at: None,
        }
    }
}

impl EngineState {
    /// Tasks created but not yet in a terminal bucket.
    pub fn in_flight(&self) -> u64 {
        self.tasks_total.saturating_sub(
            self.tasks_completed
                + self.tasks_failed
                + self.tasks_abandoned
                + self.tasks_running_at_shutdown,
        )
    }

    /// Completed share of finished executions, in percent.
    pub fn success_rate(&self) -> f64 {
        let finished = self.tasks_completed + self.tasks_failed;
        if finished == 0 {
            return 0.0;
        }
        self.tasks_completed as f64 / finished as f64 * 100.0
    }

    /// Completed tasks per second since start, up to `now` or the stop time.
    pub fn throughput_per_sec(&self, now: DateTime<Utc>) -> f64 {
        let Some(started_at) = self.started_at else {
            return 0.0;
        };
        let end = self.stopped_at.unwrap_or(now);
        let secs = (end - started_at).num_milliseconds() as f64 / 1000.0;
        if secs <= 0.0 {
            return 0.0;
        }
        self.tasks_completed as f64 / secs
    }

    /// Every created task sits in exactly one terminal bucket.
    pub fn is_accounted(&self) -> bool {
        self.tasks_abandoned
            + self.tasks_completed
            + self.tasks_failed
            + self.tasks_running_at_shutdown
            == self.tasks_total
    }
}

/// How a task left the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed,
    Abandoned,
    RunningAtShutdown,
}

/// Terminal record kept in the bounded history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub chain_id: ChainId,
    pub kind: TaskKind,
    pub subject: PathBuf,
    pub status: TaskStatus,
    pub outcome: TaskOutcome,
    pub attempt: u32,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl TaskRecord {
    fn new(task: &Task, outcome: TaskOutcome) -> Self {
        Self {
            task_id: task.id(),
            chain_id: task.chain(),
            kind: task.kind(),
            subject: task.subject().to_path_buf(),
            status: task.status(),
            outcome,
            attempt: task.attempt(),
            error: task.last_error().map(str::to_string),
            finished_at: Utc::now(),
        }
    }
}

/// Last terminal failure recorded against a subject.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub attempt: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbandonedTask {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub subject: PathBuf,
    pub reason: AbandonReason,
}

/// Where a subject's current task is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SlotPhase {
    Queued,
    Running,
    Delayed,
}

/// Dedup entry for one subject with an active chain.
#[derive(Debug)]
pub(crate) struct SubjectSlot {
    pub(crate) chain: ChainId,
    pub(crate) current: TaskId,
    pub(crate) current_kind: TaskKind,
    pub(crate) phase: SlotPhase,
    pub(crate) follow_ups: VecDeque<Task>,
}

impl SubjectSlot {
    pub(crate) fn new(task: &Task, phase: SlotPhase) -> Self {
        Self {
            chain: task.chain(),
            current: task.id(),
            current_kind: task.kind(),
            phase,
            follow_ups: VecDeque::new(),
        }
    }

    pub(crate) fn point_at(&mut self, target: SlotTarget, phase: SlotPhase) {
        self.chain = target.chain;
        self.current = target.id;
        self.current_kind = target.kind;
        self.phase = phase;
    }
}

/// Identity of a task that is about to move into the queue.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SlotTarget {
    pub(crate) id: TaskId,
    pub(crate) chain: ChainId,
    pub(crate) kind: TaskKind,
}

impl SlotTarget {
    pub(crate) fn of(task: &Task) -> Self {
        Self {
            id: task.id(),
            chain: task.chain(),
            kind: task.kind(),
        }
    }
}

/// Task waiting for a timer before it re-enters the queue.
#[derive(Debug)]
pub(crate) struct DelayedEntry {
    pub(crate) task: Task,
    /// Set for retry backoff, cleared for backpressure re-enqueue.
    pub(crate) retrying: bool,
}

#[derive(Debug)]
pub(crate) struct RunningEntry {
    pub(crate) task: Task,
    pub(crate) cancel: ShutdownToken,
    pub(crate) worker: usize,
}

/// Counter mutations. Applied only through [`LedgerInner::record`].
pub(crate) enum LedgerEvent<'a> {
    Created,
    Coalesced,
    Started,
    Completed { task: &'a Task },
    RetryScheduled,
    RetryReleased,
    Failed { task: &'a Task },
    Abandoned {
        task: &'a Task,
        reason: AbandonReason,
        was_retrying: bool,
    },
    RunningAtShutdown { task: &'a Task },
    ChainEnded { succeeded: bool },
    Status(EngineStatus),
}

pub(crate) struct LedgerInner {
    state: EngineState,
    pub(crate) slots: HashMap<PathBuf, SubjectSlot>,
    pub(crate) delayed: HashMap<TaskId, DelayedEntry>,
    pub(crate) running: HashMap<TaskId, RunningEntry>,
    failures: BTreeMap<PathBuf, FailureRecord>,
    history: VecDeque<TaskRecord>,
    history_capacity: usize,
    abandoned: Vec<AbandonedTask>,
    consecutive_failures: u32,
    degraded_after: u32,
}

impl LedgerInner {
    pub(crate) fn state(&self) -> &EngineState {
        &self.state
    }

    pub(crate) fn status(&self) -> EngineStatus {
        self.state.status
    }

    pub(crate) fn abandoned(&self) -> &[AbandonedTask] {
        &self.abandoned
    }

    pub(crate) fn record(&mut self, event: LedgerEvent<'_>) {
        let state = &mut self.state;
        match event {
            LedgerEvent::Created => state.tasks_total += 1,
            LedgerEvent::Coalesced => state.tasks_coalesced += 1,
            LedgerEvent::Started => state.workers_busy += 1,
            LedgerEvent::Completed { task } => {
                state.workers_busy = state.workers_busy.saturating_sub(1);
                state.tasks_completed += 1;
                *state.completed_by_kind.entry(task.kind()).or_default() += 1;
                if task.kind() == TaskKind::Index {
                    *state.extensions.entry(task.extension()).or_default() += 1;
                }
                self.consecutive_failures = 0;
                if state.status == EngineStatus::Degraded {
                    state.status = EngineStatus::Running;
                }
                push_history(
                    &mut self.history,
                    self.history_capacity,
                    TaskRecord::new(task, TaskOutcome::Completed),
                );
            }
            LedgerEvent::RetryScheduled => {
                state.workers_busy = state.workers_busy.saturating_sub(1);
                state.tasks_retrying += 1;
            }
            LedgerEvent::RetryReleased => {
                state.tasks_retrying = state.tasks_retrying.saturating_sub(1);
            }
            LedgerEvent::Failed { task } => {
                state.workers_busy = state.workers_busy.saturating_sub(1);
                state.tasks_failed += 1;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if state.status == EngineStatus::Running
                    && self.consecutive_failures >= self.degraded_after
                {
                    state.status = EngineStatus::Degraded;
                }
                self.failures.insert(
                    task.subject().to_path_buf(),
                    FailureRecord {
                        task_id: task.id(),
                        kind: task.kind(),
                        attempt: task.attempt(),
                        error: task.last_error().unwrap_or_default().to_string(),
                        failed_at: Utc::now(),
                    },
                );
                push_history(
                    &mut self.history,
                    self.history_capacity,
                    TaskRecord::new(task, TaskOutcome::Failed),
                );
            }
            LedgerEvent::Abandoned {
                task,
                reason,
                was_retrying,
            } => {
                state.tasks_abandoned += 1;
                if was_retrying {
                    state.tasks_retrying = state.tasks_retrying.saturating_sub(1);
                }
                self.abandoned.push(AbandonedTask {
                    task_id: task.id(),
                    kind: task.kind(),
                    subject: task.subject().to_path_buf(),
                    reason,
                });
                push_history(
                    &mut self.history,
                    self.history_capacity,
                    TaskRecord::new(task, TaskOutcome::Abandoned),
                );
            }
            LedgerEvent::RunningAtShutdown { task } => {
                state.workers_busy = state.workers_busy.saturating_sub(1);
                state.tasks_running_at_shutdown += 1;
                push_history(
                    &mut self.history,
                    self.history_capacity,
                    TaskRecord::new(task, TaskOutcome::RunningAtShutdown),
                );
            }
            LedgerEvent::ChainEnded { succeeded } => {
                if succeeded {
                    state.chains_completed += 1;
                } else {
                    state.chains_failed += 1;
                }
            }
            LedgerEvent::Status(status) => {
                state.status = status;
                match status {
                    EngineStatus::Running if state.started_at.is_none() => {
                        state.started_at = Some(Utc::now());
                    }
                    EngineStatus::Stopped => state.stopped_at = Some(Utc::now()),
                    _ => {}
                }
            }
        }
    }

    /// Forget a subject's earlier failure once a later chain succeeds.
    pub(crate) fn clear_failure(&mut self, subject: &std::path::Path) {
        self.failures.remove(subject);
    }
}

fn push_history(history: &mut VecDeque<TaskRecord>, capacity: usize, record: TaskRecord) {
    if capacity == 0 {
        return;
    }
    while history.len() >= capacity {
        history.pop_front();
    }
    history.push_back(record);
}

/// Single owner of the engine's bookkeeping, behind one mutex.
///
/// Lock order: the ledger is always taken before the queue's internal lock.
pub struct StateLedger {
    inner: Mutex<LedgerInner>,
}

impl fmt::Debug for StateLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StateLedger")
            .field("status", &inner.state.status)
            .field("subjects", &inner.slots.len())
            .field("running", &inner.running.len())
            .field("delayed", &inner.delayed.len())
            .finish()
    }
}

impl StateLedger {
    /// Create an empty ledger.
    pub fn new(history_capacity: usize, degraded_after: u32) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                state: EngineState::default(),
                slots: HashMap::new(),
                delayed: HashMap::new(),
                running: HashMap::new(),
                failures: BTreeMap::new(),
                history: VecDeque::with_capacity(history_capacity.min(1024)),
                history_capacity,
                abandoned: Vec::new(),
                consecutive_failures: 0,
                degraded_after: degraded_after.max(1),
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock()
    }

    /// Last terminal failure per subject.
    pub fn failures(&self) -> BTreeMap<PathBuf, FailureRecord> {
        self.inner.lock().failures.clone()
    }

    /// Recent terminal task records, oldest first.
    pub fn history(&self) -> Vec<TaskRecord> {
        self.inner.lock().history.iter().cloned().collect()
    }
}
