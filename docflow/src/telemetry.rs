//! Tracing instrumentation for docflow.
//!
//! Span constructors for the task lifecycle plus record helpers that log an
//! event and, with the `metrics` feature enabled, update the Prometheus
//! collectors in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use docflow::telemetry::{dispatch_span, record_task_submitted};
//!
//! let span = dispatch_span(task.id(), task.kind(), 0);
//! let _enter = span.enter();
//! record_task_submitted(task.kind(), task.priority());
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{info_span, Instrument, Span};

use crate::collaborator::{SampleOutcome, TaskSample};
use crate::events::AbandonReason;
use crate::task::{Priority, TaskId, TaskKind};

/// Span covering one `submit` call.
#[must_use]
pub fn submit_span(subject: impl AsRef<str>, kind: TaskKind, priority: Priority) -> Span {
    info_span!(
        "docflow.submit",
        subject = %subject.as_ref(),
        task_kind = %kind,
        priority = priority.0,
    )
}

/// Span covering one execution attempt on a worker.
#[must_use]
pub fn dispatch_span(task_id: TaskId, kind: TaskKind, worker: usize) -> Span {
    info_span!(
        "docflow.dispatch",
        task_id = %task_id,
        task_kind = %kind,
        worker = worker,
    )
}

/// Span covering the bookkeeping after an execution finished.
#[must_use]
pub fn complete_span(task_id: TaskId, kind: TaskKind, status: impl AsRef<str>) -> Span {
    info_span!(
        "docflow.complete",
        task_id = %task_id,
        task_kind = %kind,
        status = %status.as_ref(),
    )
}

/// Span covering a delayed re-enqueue.
#[must_use]
pub fn retry_span(task_id: TaskId, kind: TaskKind, attempt: u32) -> Span {
    info_span!(
        "docflow.retry",
        task_id = %task_id,
        task_kind = %kind,
        attempt = attempt,
    )
}

#[must_use]
pub fn shutdown_span(deadline: Duration) -> Span {
    info_span!("docflow.shutdown", deadline_ms = deadline.as_millis() as u64)
}

/// Attach a dispatch span to `future`.
pub fn instrument_dispatch<F>(
    task_id: TaskId,
    kind: TaskKind,
    worker: usize,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(dispatch_span(task_id, kind, worker))
}

/// Log an accepted submission and count it.
pub fn record_task_submitted(kind: TaskKind, priority: Priority) {
    tracing::debug!(task_kind = %kind, priority = priority.0, "task submitted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_submitted(kind.as_str());
}

/// Log a task abandoned at shutdown and count it.
pub fn record_task_abandoned(task_id: TaskId, kind: TaskKind, reason: AbandonReason) {
    tracing::warn!(task_id = %task_id, task_kind = %kind, reason = ?reason, "task abandoned");

    #[cfg(feature = "metrics")]
    crate::metrics::record_task_abandoned(kind.as_str());
}

/// Publish the current queue depth.
pub fn set_queue_depth(depth: usize) {
    tracing::trace!(depth = depth, "queue depth updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(depth as f64);
}

/// Log one execution sample.
pub fn record_task_sample(sample: &TaskSample) {
    let duration_ms = sample.duration.as_millis() as u64;
    match sample.outcome {
        SampleOutcome::Completed => tracing::info!(
            task_id = %sample.task_id,
            task_kind = %sample.kind,
            subject = %sample.subject.display(),
            attempt = sample.attempt,
            duration_ms = duration_ms,
            "task completed"
        ),
        SampleOutcome::Retrying => tracing::warn!(
            task_id = %sample.task_id,
            task_kind = %sample.kind,
            subject = %sample.subject.display(),
            attempt = sample.attempt,
            duration_ms = duration_ms,
            error = sample.error.as_deref().unwrap_or_default(),
            "task failed, retry scheduled"
        ),
        SampleOutcome::Failed => tracing::error!(
            task_id = %sample.task_id,
            task_kind = %sample.kind,
            subject = %sample.subject.display(),
            attempt = sample.attempt,
            duration_ms = duration_ms,
            error = sample.error.as_deref().unwrap_or_default(),
            "task failed"
        ),
    }
}

/// Start timing an execution attempt.
pub fn record_task_start(task_id: TaskId) -> TaskTimer {
    TaskTimer {
        task_id,
        start: Instant::now(),
    }
}

/// Opaque timer returned by [`record_task_start`].
#[derive(Debug)]
pub struct TaskTimer {
    task_id: TaskId,
    start: Instant,
}

impl TaskTimer {
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        let id = TaskId::new();
        let spans = [
            (submit_span("a.md", TaskKind::Parse, Priority::NORMAL), "docflow.submit"),
            (dispatch_span(id, TaskKind::Parse, 1), "docflow.dispatch"),
            (complete_span(id, TaskKind::Index, "completed"), "docflow.complete"),
            (retry_span(id, TaskKind::Update, 2), "docflow.retry"),
            (shutdown_span(Duration::from_secs(1)), "docflow.shutdown"),
        ];
        for (span, name) in spans {
            assert_eq!(span.metadata().unwrap().name(), name);
        }
    }

    #[test]
    fn test_timer() {
        let id = TaskId::new();
        let timer = record_task_start(id);
        assert_eq!(timer.task_id(), id);
        std::thread::sleep(Duration::from_millis(1));
        assert!(timer.elapsed() >= Duration::from_millis(1));
    }
}
