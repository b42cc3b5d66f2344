use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::QueueError;
use crate::runtime::ShutdownToken;
use crate::task::{Priority, Task, TaskId};

/// Bounded in-memory priority queue shared by all workers.
///
/// Lower [`Priority`] values dequeue first; equal priorities dequeue in
/// insertion order. Enqueue never waits: a full queue is reported to the
/// caller immediately.
pub struct PriorityQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

struct QueueInner {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
    closed: bool,
}

struct QueueEntry {
    priority: Priority,
    seq: u64,
    task: Task,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap: the smallest (priority, seq) must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A task the queue refused, returned to the caller.
#[derive(Debug)]
pub struct Rejected {
    pub error: QueueError,
    pub task: Task,
}

impl fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PriorityQueue")
            .field("capacity", &self.capacity)
            .field("len", &inner.heap.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl PriorityQueue {
    /// Create a queue holding at most `capacity` tasks. A capacity of zero is
    /// raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::with_capacity(capacity.min(4096)),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Insert a task. Fails fast when full or closed.
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.offer(task).map_err(|rejected| rejected.error)
    }

    /// Like [`enqueue`](Self::enqueue), but hands the task back on rejection.
    pub fn offer(&self, task: Task) -> Result<(), Rejected> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(Rejected {
                    error: QueueError::Closed,
                    task,
                });
            }
            if inner.heap.len() >= self.capacity {
                return Err(Rejected {
                    error: QueueError::Full,
                    task,
                });
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(QueueEntry {
                priority: task.priority(),
                seq,
                task,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the most urgent task.
    ///
    /// Returns [`QueueError::Cancelled`] once `cancel` fires, and
    /// [`QueueError::Closed`] when the queue is closed and empty. Items still
    /// queued at close time are handed out before `Closed` is reported.
    pub async fn dequeue(&self, cancel: &ShutdownToken) -> Result<Task, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            if let Some(task) = self.try_dequeue()? {
                return Ok(task);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// Pop the most urgent task without waiting.
    ///
    /// `Ok(None)` means the queue is open but empty.
    pub fn try_dequeue(&self) -> Result<Option<Task>, QueueError> {
        let mut inner = self.inner.lock();
        match inner.heap.pop() {
            Some(entry) => Ok(Some(entry.task)),
            None if inner.closed => Err(QueueError::Closed),
            None => Ok(None),
        }
    }

    /// Raise the priority of a queued task. Returns false when the task is not
    /// queued or already at least as urgent.
    pub fn promote(&self, id: TaskId, priority: Priority) -> bool {
        let mut inner = self.inner.lock();
        let mut entries = std::mem::take(&mut inner.heap).into_vec();
        let mut promoted = false;
        if let Some(entry) = entries.iter_mut().find(|entry| entry.task.id() == id) {
            if entry.task.promote(priority) {
                entry.priority = priority;
                promoted = true;
            }
        }
        inner.heap = BinaryHeap::from(entries);
        promoted
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Check if no task is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// Maximum number of queued tasks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuse further enqueues and wake every waiting consumer.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Check if the queue was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Remove every queued task in dequeue order.
    pub fn drain(&self) -> Vec<Task> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::with_capacity(inner.heap.len());
        while let Some(entry) = inner.heap.pop() {
            drained.push(entry.task);
        }
        drained
    }
}
