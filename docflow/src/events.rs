use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::retry::GiveUpReason;
use crate::task::{ChainId, Priority, Task, TaskId, TaskKind};

/// Metadata envelope attached to every task event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub task_id: TaskId,
    pub chain_id: ChainId,
    pub subject: PathBuf,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    /// Metadata for an event about `task`.
    pub fn for_task(task: &Task) -> Self {
        Self {
            version: 1,
            task_id: task.id(),
            chain_id: task.chain(),
            subject: task.subject().to_path_buf(),
            timestamp: Utc::now(),
        }
    }
}

/// Task lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEvent {
    pub meta: EventMeta,
    pub payload: TaskEventPayload,
}

impl TaskEvent {
    /// Build an event for a task.
    pub fn new(task: &Task, payload: TaskEventPayload) -> Self {
        Self {
            meta: EventMeta::for_task(task),
            payload,
        }
    }

    /// Build an event from its identifiers when the task itself is not at hand.
    pub fn from_parts(
        task_id: TaskId,
        chain_id: ChainId,
        subject: impl Into<PathBuf>,
        payload: TaskEventPayload,
    ) -> Self {
        Self {
            meta: EventMeta {
                version: 1,
                task_id,
                chain_id,
                subject: subject.into(),
                timestamp: Utc::now(),
            },
            payload,
        }
    }

    /// Id of the task the event is about.
    pub fn task_id(&self) -> TaskId {
        self.meta.task_id
    }
}

/// Why queued or parked work was dropped without running.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// Still queued when shutdown began.
    Queued,
    /// Waiting on a retry or backpressure timer when shutdown began.
    Delayed,
    /// Parked behind another chain of the same subject.
    FollowUp,
    /// Successor created after shutdown began.
    Successor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum TaskEventPayload {
    /// A new chain was accepted for an idle subject.
    Submitted { kind: TaskKind, priority: Priority },
    /// A submission merged into the queued task named in the metadata.
    Coalesced { kind: TaskKind, priority: Priority },
    /// A follow-up task was parked behind the subject's current chain.
    Deferred { kind: TaskKind, behind: TaskId },
    /// The task entered the queue.
    Enqueued {
        kind: TaskKind,
        priority: Priority,
        attempt: u32,
    },
    /// A worker began executing the task.
    Started {
        kind: TaskKind,
        attempt: u32,
        worker: usize,
    },
    Completed {
        kind: TaskKind,
        attempt: u32,
        duration_ms: u64,
    },
    /// A failure will be retried after `delay_ms`.
    RetryScheduled {
        kind: TaskKind,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    /// Terminal failure; the chain halts.
    Failed {
        kind: TaskKind,
        attempt: u32,
        reason: GiveUpReason,
        error: String,
    },
    Abandoned { kind: TaskKind, reason: AbandonReason },
    /// The last task of the chain reached a terminal state.
    ChainCompleted { succeeded: bool },
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and skips ahead.
pub struct InProcEventBus {
    sender: broadcast::Sender<TaskEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Buffer size per subscriber.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event. Dropped silently when nobody is subscribed.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to all subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}
