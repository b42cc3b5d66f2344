use std::time::Duration;

use thiserror::Error;

use crate::task::{TaskId, TaskKind, TaskStatus};

/// Errors returned by the orchestrator's public operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("no handler registered for task kind {0}")]
    UnsupportedKind(TaskKind),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("stop deadline exceeded: {running} task(s) still running, {abandoned} abandoned")]
    StopDeadlineExceeded { running: u64, abandoned: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Errors returned by [`PriorityQueue`](crate::queue::PriorityQueue) operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is closed")]
    Closed,

    #[error("dequeue cancelled")]
    Cancelled,
}

/// Failure reported by a collaborator (parser, storage) or by the worker
/// wrapping its execution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("collaborator panicked: {0}")]
    Panicked(String),
}

impl CollaboratorError {
    /// Retryable failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Failure that retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::TimedOut(_))
    }

    /// Short label used for metrics and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::TimedOut(_) => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
        }
    }
}

/// Raised when a task is asked to make a status transition its current
/// status does not allow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("task {task_id}: illegal transition {from} -> {to}")]
pub struct TaskStateError {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CollaboratorError::transient("db locked").is_retryable());
        assert!(CollaboratorError::TimedOut(Duration::from_secs(1)).is_retryable());
        assert!(!CollaboratorError::permanent("bad pdf").is_retryable());
        assert!(!CollaboratorError::Cancelled.is_retryable());
        assert!(!CollaboratorError::Panicked("boom".into()).is_retryable());
    }

    #[test]
    fn test_engine_error_display() {
        let err = EngineError::QueueFull { capacity: 8 };
        assert_eq!(err.to_string(), "task queue is full (capacity 8)");
        let err = EngineError::StopDeadlineExceeded {
            running: 2,
            abandoned: 5,
        };
        assert!(err.to_string().contains("2 task(s) still running"));
    }
}
