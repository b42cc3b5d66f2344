use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify};
use tracing::Instrument;

use crate::collaborator::{ChangeEvent, ChangeSource, HandlerOutput, HandlerTable, MetricsSink};
use crate::config::EngineConfig;
use crate::error::{CollaboratorError, EngineError, QueueError};
use crate::events::{AbandonReason, InProcEventBus, TaskEvent, TaskEventPayload};
use crate::queue::{PriorityQueue, Rejected};
use crate::retry::{GiveUpReason, RetryPolicy};
use crate::state::{
    AbandonedTask, DelayedEntry, EngineState, EngineStatus, FailureRecord, LedgerEvent,
    LedgerInner, RunningEntry, SlotPhase, SlotTarget, StateLedger, SubjectSlot, TaskRecord,
};
use crate::task::{Priority, Task, TaskId, TaskKind, TaskStatus};
use crate::telemetry;

use super::worker::{PoolStopOutcome, TaskReporter, WorkerPool, WorkerShared};

/// Cancellation signal shared between the engine, its workers and the
/// collaborators executing a task.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // Register before checking the flag so a concurrent cancel is not missed.
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopOutcome {
    /// Every running task finished before the deadline.
    Drained,
    /// The deadline elapsed and busy workers were aborted.
    DeadlineExceeded,
}

/// Summary returned by [`Orchestrator::stop`].
#[derive(Clone, Debug)]
pub struct StopReport {
    pub outcome: StopOutcome,
    pub state: EngineState,
    /// Work dropped without running, in the order it was abandoned.
    pub abandoned: Vec<AbandonedTask>,
    /// Tasks interrupted by the deadline.
    pub running_at_shutdown: Vec<TaskId>,
}

/// Counts from one [`Orchestrator::consume`] run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConsumeReport {
    pub accepted: u64,
    pub rejected: u64,
}

/// Shared engine state: the ledger, the queue and everything workers report
/// back into.
pub(crate) struct EngineCore {
    config: EngineConfig,
    ledger: StateLedger,
    queue: Arc<PriorityQueue>,
    events: InProcEventBus,
    handlers: HandlerTable,
    shutdown: ShutdownToken,
    self_ref: Weak<EngineCore>,
}

impl EngineCore {
    fn submit(
        &self,
        subject: PathBuf,
        kind: TaskKind,
        priority: Priority,
    ) -> Result<TaskId, EngineError> {
        if subject.as_os_str().is_empty() {
            return Err(EngineError::InvalidSubmission("empty path".into()));
        }
        if !kind.is_submittable() {
            return Err(EngineError::InvalidSubmission(
                "index tasks are created by the engine after a successful parse".into(),
            ));
        }
        if !self.handlers.supports_chain(kind) {
            return Err(EngineError::UnsupportedKind(kind));
        }

        let span = telemetry::submit_span(subject.display().to_string(), kind, priority);
        let _enter = span.enter();

        let mut inner = self.ledger.lock();
        if !inner.status().accepts_work() {
            return Err(EngineError::ShuttingDown);
        }

        let Some(slot) = inner.slots.get_mut(&subject) else {
            return self.submit_new_chain(&mut inner, subject, kind, priority);
        };

        // Coalescing past a parked follow-up would reorder the subject's changes.
        if slot.phase == SlotPhase::Queued
            && slot.current_kind == kind
            && slot.follow_ups.is_empty()
        {
            let (id, chain) = (slot.current, slot.chain);
            self.queue.promote(id, priority);
            inner.record(LedgerEvent::Coalesced);
            self.events.publish(TaskEvent::from_parts(
                id,
                chain,
                subject,
                TaskEventPayload::Coalesced { kind, priority },
            ));
            return Ok(id);
        }

        if let Some(last) = slot.follow_ups.back_mut().filter(|task| task.kind() == kind) {
            last.promote(priority);
            let id = last.id();
            let event = TaskEvent::new(last, TaskEventPayload::Coalesced { kind, priority });
            inner.record(LedgerEvent::Coalesced);
            self.events.publish(event);
            return Ok(id);
        }

        let behind = slot.current;
        let follow_up = Task::new(kind, subject, priority);
        let id = follow_up.id();
        let event = TaskEvent::new(&follow_up, TaskEventPayload::Deferred { kind, behind });
        slot.follow_ups.push_back(follow_up);
        inner.record(LedgerEvent::Created);
        self.events.publish(event);
        tracing::debug!(task_id = %id, behind = %behind, "follow-up parked");
        Ok(id)
    }

    fn submit_new_chain(
        &self,
        inner: &mut LedgerInner,
        subject: PathBuf,
        kind: TaskKind,
        priority: Priority,
    ) -> Result<TaskId, EngineError> {
        let task = Task::new(kind, subject.clone(), priority);
        let id = task.id();
        let slot = SubjectSlot::new(&task, SlotPhase::Queued);
        let submitted = TaskEvent::new(&task, TaskEventPayload::Submitted { kind, priority });
        let enqueued = enqueued_event(&task);

        if let Err(err) = self.queue.enqueue(task) {
            return Err(match err {
                QueueError::Full => EngineError::QueueFull {
                    capacity: self.queue.capacity(),
                },
                QueueError::Closed | QueueError::Cancelled => EngineError::ShuttingDown,
            });
        }

        inner.record(LedgerEvent::Created);
        inner.slots.insert(subject, slot);
        self.events.publish(submitted);
        self.events.publish(enqueued);
        telemetry::record_task_submitted(kind, priority);
        telemetry::set_queue_depth(self.queue.len());
        Ok(id)
    }

    /// Put a task owned by a subject slot into the queue. Falls back to a
    /// delayed retry when the queue is full. Returns where the task ended up,
    /// or `None` when it was abandoned.
    fn place_locked(
        &self,
        inner: &mut LedgerInner,
        task: Task,
        retrying: bool,
        reason: AbandonReason,
    ) -> Option<SlotPhase> {
        if !inner.status().accepts_work() {
            self.abandon_locked(inner, task, reason, retrying);
            return None;
        }

        let event = enqueued_event(&task);
        match self.queue.offer(task) {
            Ok(()) => {
                if retrying {
                    inner.record(LedgerEvent::RetryReleased);
                }
                self.events.publish(event);
                telemetry::set_queue_depth(self.queue.len());
                Some(SlotPhase::Queued)
            }
            Err(Rejected {
                error: QueueError::Full,
                task,
            }) => {
                tracing::debug!(task_id = %task.id(), "queue full, re-enqueue delayed");
                self.defer_locked(inner, task, self.config.requeue_interval(), retrying);
                Some(SlotPhase::Delayed)
            }
            Err(Rejected { task, .. }) => {
                self.abandon_locked(inner, task, reason, retrying);
                None
            }
        }
    }

    /// Park `task` in the delayed registry and arm its timer.
    fn defer_locked(&self, inner: &mut LedgerInner, task: Task, delay: Duration, retrying: bool) {
        let id = task.id();
        let span = telemetry::retry_span(id, task.kind(), task.attempt());
        inner.delayed.insert(id, DelayedEntry { task, retrying });

        let Some(core) = self.self_ref.upgrade() else {
            return;
        };
        let shutdown = self.shutdown.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => core.release_delayed(id),
                    _ = shutdown.cancelled() => {}
                }
            }
            .instrument(span),
        );
    }

    /// Timer callback. Whoever removes the entry from the delayed registry
    /// first decides its fate; shutdown may already have abandoned it.
    fn release_delayed(&self, id: TaskId) {
        let mut inner = self.ledger.lock();
        let Some(DelayedEntry { mut task, retrying }) = inner.delayed.remove(&id) else {
            return;
        };
        if task.status() == TaskStatus::Retrying {
            if let Err(err) = task.mark_pending() {
                tracing::warn!("{err}");
            }
        }
        let subject = task.subject().to_path_buf();
        let target = SlotTarget::of(&task);
        match self.place_locked(&mut inner, task, retrying, AbandonReason::Delayed) {
            Some(phase) => {
                if let Some(slot) = inner.slots.get_mut(&subject) {
                    slot.point_at(target, phase);
                }
            }
            None => self.drop_slot_locked(&mut inner, &subject),
        }
    }

    fn abandon_locked(
        &self,
        inner: &mut LedgerInner,
        task: Task,
        reason: AbandonReason,
        was_retrying: bool,
    ) {
        inner.record(LedgerEvent::Abandoned {
            task: &task,
            reason,
            was_retrying,
        });
        telemetry::record_task_abandoned(task.id(), task.kind(), reason);
        self.events.publish(TaskEvent::new(
            &task,
            TaskEventPayload::Abandoned {
                kind: task.kind(),
                reason,
            },
        ));
    }

    /// Remove a subject's slot, abandoning its parked follow-ups.
    fn drop_slot_locked(&self, inner: &mut LedgerInner, subject: &Path) {
        if let Some(slot) = inner.slots.remove(subject) {
            for follow_up in slot.follow_ups {
                self.abandon_locked(inner, follow_up, AbandonReason::FollowUp, false);
            }
        }
    }

    /// The chain that `last` belonged to is over; start the subject's next
    /// follow-up or release the slot.
    fn finish_chain_locked(&self, inner: &mut LedgerInner, last: &Task, succeeded: bool) {
        inner.record(LedgerEvent::ChainEnded { succeeded });
        self.events.publish(TaskEvent::new(
            last,
            TaskEventPayload::ChainCompleted { succeeded },
        ));

        let subject = last.subject();
        let next = inner
            .slots
            .get_mut(subject)
            .and_then(|slot| slot.follow_ups.pop_front());
        let Some(next) = next else {
            inner.slots.remove(subject);
            return;
        };

        let target = SlotTarget::of(&next);
        self.events.publish(TaskEvent::new(
            &next,
            TaskEventPayload::Submitted {
                kind: next.kind(),
                priority: next.priority(),
            },
        ));
        match self.place_locked(inner, next, false, AbandonReason::FollowUp) {
            Some(phase) => {
                if let Some(slot) = inner.slots.get_mut(subject) {
                    slot.point_at(target, phase);
                }
            }
            None => self.drop_slot_locked(inner, subject),
        }
    }

    /// Shutdown steps 3 and 4: close the queue and abandon everything that has
    /// not started running.
    fn abandon_pending(&self) {
        let mut inner = self.ledger.lock();
        self.queue.close();
        for task in self.queue.drain() {
            self.abandon_locked(&mut inner, task, AbandonReason::Queued, false);
        }

        let mut delayed: Vec<DelayedEntry> =
            inner.delayed.drain().map(|(_, entry)| entry).collect();
        delayed.sort_by_key(|entry| entry.task.id());
        for entry in delayed {
            self.abandon_locked(&mut inner, entry.task, AbandonReason::Delayed, entry.retrying);
        }

        let mut follow_ups = Vec::new();
        inner.slots.retain(|_, slot| {
            follow_ups.extend(slot.follow_ups.drain(..));
            slot.phase == SlotPhase::Running
        });
        for task in follow_ups {
            self.abandon_locked(&mut inner, task, AbandonReason::FollowUp, false);
        }
        telemetry::set_queue_depth(0);
    }

    /// Shutdown step 7: count what is still registered as running and mark the
    /// engine stopped.
    fn finish_stop(&self, outcome: PoolStopOutcome) -> StopReport {
        let mut inner = self.ledger.lock();
        let mut running: Vec<RunningEntry> =
            inner.running.drain().map(|(_, entry)| entry).collect();
        running.sort_by_key(|entry| entry.task.id());
        let mut interrupted = Vec::with_capacity(running.len());
        for entry in running {
            tracing::warn!(
                task_id = %entry.task.id(),
                worker = entry.worker,
                "task still running at shutdown"
            );
            inner.record(LedgerEvent::RunningAtShutdown { task: &entry.task });
            interrupted.push(entry.task.id());
        }
        inner.slots.clear();
        inner.record(LedgerEvent::Status(EngineStatus::Stopped));

        let mut state = inner.state().clone();
        state.queue_depth = self.queue.len() as u64;
        StopReport {
            outcome: match outcome {
                PoolStopOutcome::Drained => StopOutcome::Drained,
                PoolStopOutcome::DeadlineExceeded { .. } => StopOutcome::DeadlineExceeded,
            },
            state,
            abandoned: inner.abandoned().to_vec(),
            running_at_shutdown: interrupted,
        }
    }

    fn snapshot(&self) -> EngineState {
        let inner = self.ledger.lock();
        let mut state = inner.state().clone();
        state.queue_depth = self.queue.len() as u64;
        state
    }
}

impl TaskReporter for EngineCore {
    fn task_started(&self, task: &mut Task, worker: usize) -> Option<ShutdownToken> {
        let mut inner = self.ledger.lock();
        inner.record(LedgerEvent::Started);
        if let Err(err) = task.mark_running() {
            tracing::error!("{err}");
            inner.record(LedgerEvent::Failed { task });
            self.finish_chain_locked(&mut inner, task, false);
            return None;
        }

        let cancel = ShutdownToken::new();
        inner.running.insert(
            task.id(),
            RunningEntry {
                task: task.clone(),
                cancel: cancel.clone(),
                worker,
            },
        );
        if let Some(slot) = inner.slots.get_mut(task.subject()) {
            slot.phase = SlotPhase::Running;
        }
        self.events.publish(TaskEvent::new(
            task,
            TaskEventPayload::Started {
                kind: task.kind(),
                attempt: task.attempt(),
                worker,
            },
        ));
        telemetry::set_queue_depth(self.queue.len());
        Some(cancel)
    }

    fn task_completed(&self, mut task: Task, output: HandlerOutput, elapsed: Duration) {
        let _span = telemetry::complete_span(task.id(), task.kind(), "completed").entered();
        let mut inner = self.ledger.lock();
        inner.running.remove(&task.id());
        if let Err(err) = task.mark_completed() {
            tracing::warn!("{err}");
        }
        inner.record(LedgerEvent::Completed { task: &task });
        self.events.publish(TaskEvent::new(
            &task,
            TaskEventPayload::Completed {
                kind: task.kind(),
                attempt: task.attempt(),
                duration_ms: elapsed.as_millis() as u64,
            },
        ));

        if !task.kind().produces_document() {
            inner.clear_failure(task.subject());
            self.finish_chain_locked(&mut inner, &task, true);
            return;
        }

        let index = task.successor(TaskKind::Index, output.payload);
        let target = SlotTarget::of(&index);
        inner.record(LedgerEvent::Created);
        match self.place_locked(&mut inner, index, false, AbandonReason::Successor) {
            Some(phase) => {
                if let Some(slot) = inner.slots.get_mut(task.subject()) {
                    slot.point_at(target, phase);
                }
            }
            None => self.drop_slot_locked(&mut inner, task.subject()),
        }
    }

    fn task_retry(
        &self,
        mut task: Task,
        delay: Duration,
        error: &CollaboratorError,
        _elapsed: Duration,
    ) {
        let _span = telemetry::complete_span(task.id(), task.kind(), "retrying").entered();
        let mut inner = self.ledger.lock();
        inner.running.remove(&task.id());
        if let Err(err) = task.mark_retrying(error.to_string()) {
            tracing::warn!("{err}");
        }
        inner.record(LedgerEvent::RetryScheduled);

        if !inner.status().accepts_work() {
            let subject = task.subject().to_path_buf();
            self.abandon_locked(&mut inner, task, AbandonReason::Delayed, true);
            self.drop_slot_locked(&mut inner, &subject);
            return;
        }

        self.events.publish(TaskEvent::new(
            &task,
            TaskEventPayload::RetryScheduled {
                kind: task.kind(),
                attempt: task.attempt(),
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            },
        ));
        if let Some(slot) = inner.slots.get_mut(task.subject()) {
            slot.phase = SlotPhase::Delayed;
        }
        self.defer_locked(&mut inner, task, delay, true);
    }

    fn task_failed(
        &self,
        mut task: Task,
        reason: GiveUpReason,
        error: &CollaboratorError,
        _elapsed: Duration,
    ) {
        let _span = telemetry::complete_span(task.id(), task.kind(), "failed").entered();
        let mut inner = self.ledger.lock();
        inner.running.remove(&task.id());
        if let Err(err) = task.mark_failed(error.to_string()) {
            tracing::warn!("{err}");
        }
        inner.record(LedgerEvent::Failed { task: &task });
        self.events.publish(TaskEvent::new(
            &task,
            TaskEventPayload::Failed {
                kind: task.kind(),
                attempt: task.attempt(),
                reason,
                error: error.to_string(),
            },
        ));
        self.finish_chain_locked(&mut inner, &task, false);
    }

    fn cancel_in_flight(&self) {
        let inner = self.ledger.lock();
        for entry in inner.running.values() {
            entry.cancel.cancel();
        }
    }
}

fn enqueued_event(task: &Task) -> TaskEvent {
    TaskEvent::new(
        task,
        TaskEventPayload::Enqueued {
            kind: task.kind(),
            priority: task.priority(),
            attempt: task.attempt(),
        },
    )
}

/// Document ingestion engine: accepts submissions, runs them on a worker pool
/// and keeps the per-subject bookkeeping.
pub struct Orchestrator {
    core: Arc<EngineCore>,
    retry: RetryPolicy,
    sink: Arc<dyn MetricsSink>,
    pool: Mutex<Option<WorkerPool>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool_started = self
            .pool
            .try_lock()
            .map(|pool| pool.is_some())
            .unwrap_or_default();

        f.debug_struct("Orchestrator")
            .field("config", &self.core.config)
            .field("handlers", &self.core.handlers)
            .field("queue", &self.core.queue)
            .field("ledger", &self.core.ledger)
            .field("pool_started", &pool_started)
            .field("shutdown_cancelled", &self.core.shutdown.is_cancelled())
            .finish()
    }
}

impl Orchestrator {
    pub(crate) fn new(
        config: EngineConfig,
        handlers: HandlerTable,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let retry = RetryPolicy::new(config.retry.clone());
        let core = Arc::new_cyclic(|self_ref| EngineCore {
            ledger: StateLedger::new(config.history_capacity, config.degraded_after_failures),
            queue: Arc::new(PriorityQueue::new(config.queue_capacity)),
            events: InProcEventBus::new(config.event_capacity),
            handlers,
            shutdown: ShutdownToken::new(),
            self_ref: self_ref.clone(),
            config,
        });
        Self {
            core,
            retry,
            sink,
            pool: Mutex::new(None),
        }
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// Accept a unit of work for `path`. Never waits for execution.
    ///
    /// A submission for a subject whose chain is still active is coalesced
    /// into the queued task when nothing is parked behind it, or parked as a
    /// follow-up that starts once the current chain ends.
    pub fn submit(
        &self,
        path: impl Into<PathBuf>,
        kind: TaskKind,
        priority: Priority,
    ) -> Result<TaskId, EngineError> {
        self.core.submit(path.into(), kind, priority)
    }

    /// Submit the chain a file-system change calls for.
    pub fn ingest(&self, change: ChangeEvent) -> Result<TaskId, EngineError> {
        self.submit(change.path, change.kind.task_kind(), change.priority)
    }

    /// Feed every change from `source` into the engine until the source ends
    /// or shutdown begins. A full queue is retried every requeue interval.
    pub async fn consume<S: ChangeSource>(&self, mut source: S) -> ConsumeReport {
        let mut report = ConsumeReport::default();
        let shutdown = self.core.shutdown.clone();
        let interval = self.core.config.requeue_interval();

        loop {
            let change = tokio::select! {
                _ = shutdown.cancelled() => break,
                change = source.next_change() => change,
            };
            let Some(change) = change else {
                break;
            };

            loop {
                match self.ingest(change.clone()) {
                    Ok(_) => {
                        report.accepted += 1;
                        break;
                    }
                    Err(EngineError::QueueFull { .. }) => {
                        tokio::select! {
                            _ = shutdown.cancelled() => return report,
                            _ = tokio::time::sleep(interval) => {}
                        }
                    }
                    Err(EngineError::ShuttingDown) => return report,
                    Err(err) => {
                        tracing::warn!(path = %change.path.display(), "change rejected: {err}");
                        report.rejected += 1;
                        break;
                    }
                }
            }
        }

        report
    }

    /// Spawn the worker pool.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut pool = self.pool.lock().await;
        {
            let mut inner = self.core.ledger.lock();
            match inner.status() {
                EngineStatus::Starting => inner.record(LedgerEvent::Status(EngineStatus::Running)),
                EngineStatus::Running | EngineStatus::Degraded => {
                    return Err(EngineError::AlreadyRunning)
                }
                EngineStatus::Stopping | EngineStatus::Stopped => {
                    return Err(EngineError::ShuttingDown)
                }
            }
        }

        let shared = Arc::new(WorkerShared {
            queue: Arc::clone(&self.core.queue),
            handlers: self.core.handlers.clone(),
            retry: self.retry.clone(),
            task_timeout: self.core.config.task_timeout(),
            reporter: Arc::clone(&self.core) as Arc<dyn TaskReporter>,
            sink: Arc::clone(&self.sink),
            shutdown: self.core.shutdown.clone(),
        });
        let mut workers = WorkerPool::new(self.core.config.workers, shared);
        workers.start();
        *pool = Some(workers);
        tracing::info!(workers = self.core.config.workers, "docflow engine started");
        Ok(())
    }

    /// Graceful shutdown.
    ///
    /// Queued, delayed and parked work is abandoned immediately; running tasks
    /// get until `deadline` to finish. Returns
    /// [`EngineError::StopDeadlineExceeded`] when some were still running.
    pub async fn stop(&self, deadline: Duration) -> Result<StopReport, EngineError> {
        let span = telemetry::shutdown_span(deadline);
        async {
            {
                let mut inner = self.core.ledger.lock();
                if !inner.status().accepts_work() {
                    return Err(EngineError::NotRunning);
                }
                inner.record(LedgerEvent::Status(EngineStatus::Stopping));
            }
            tracing::info!("Initiating graceful shutdown of docflow engine");

            self.core.shutdown.cancel();
            self.core.abandon_pending();

            let pool = self.pool.lock().await.take();
            let outcome = match pool {
                Some(mut pool) => pool.stop_and_wait(deadline).await,
                None => PoolStopOutcome::Drained,
            };

            let report = self.core.finish_stop(outcome);
            tracing::info!(
                completed = report.state.tasks_completed,
                failed = report.state.tasks_failed,
                abandoned = report.state.tasks_abandoned,
                running_at_shutdown = report.state.tasks_running_at_shutdown,
                "docflow engine shutdown complete"
            );

            match report.outcome {
                StopOutcome::Drained => Ok(report),
                StopOutcome::DeadlineExceeded => Err(EngineError::StopDeadlineExceeded {
                    running: report.state.tasks_running_at_shutdown,
                    abandoned: report.state.tasks_abandoned,
                }),
            }
        }
        .instrument(span)
        .await
    }

    /// Current counters. Never waits on task execution.
    pub fn status(&self) -> EngineState {
        self.core.snapshot()
    }

    /// Subscribe to task lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.core.events.subscribe()
    }

    /// Last terminal failure per subject. Cleared when a later chain for the
    /// subject succeeds.
    pub fn failures(&self) -> BTreeMap<PathBuf, FailureRecord> {
        self.core.ledger.failures()
    }

    /// Most recent terminal task records, oldest first.
    pub fn history(&self) -> Vec<TaskRecord> {
        self.core.ledger.history()
    }

    /// Number of tasks waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.core.queue.len()
    }
}
