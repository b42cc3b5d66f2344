use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::collaborator::{
    record_sample, HandlerOutput, HandlerTable, MetricsSink, SampleOutcome, TaskSample,
};
use crate::error::CollaboratorError;
use crate::queue::PriorityQueue;
use crate::retry::{GiveUpReason, RetryDecision, RetryPolicy};
use crate::task::Task;
use crate::telemetry;

use super::supervisor::ShutdownToken;

/// Receives the lifecycle transitions of tasks executed by workers.
///
/// Implemented by the engine; every call is synchronous so a worker can never
/// be aborted between taking a task off the queue and registering it.
pub trait TaskReporter: Send + Sync {
    /// Mark the task Running and register it. Returns the per-task cancel
    /// token, or `None` when the task must not run.
    fn task_started(&self, task: &mut Task, worker: usize) -> Option<ShutdownToken>;

    fn task_completed(&self, task: Task, output: HandlerOutput, elapsed: Duration);

    fn task_retry(&self, task: Task, delay: Duration, error: &CollaboratorError, elapsed: Duration);

    fn task_failed(
        &self,
        task: Task,
        reason: GiveUpReason,
        error: &CollaboratorError,
        elapsed: Duration,
    );

    /// Cancel the per-task token of every registered running task.
    fn cancel_in_flight(&self);
}

/// State shared by every worker of a pool.
pub struct WorkerShared {
    pub queue: Arc<PriorityQueue>,
    pub handlers: HandlerTable,
    pub retry: RetryPolicy,
    pub task_timeout: Duration,
    pub reporter: Arc<dyn TaskReporter>,
    pub sink: Arc<dyn MetricsSink>,
    pub shutdown: ShutdownToken,
}

impl fmt::Debug for WorkerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerShared")
            .field("queue", &self.queue)
            .field("handlers", &self.handlers)
            .field("retry", &self.retry)
            .field("task_timeout", &self.task_timeout)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolStopOutcome {
    /// Every worker exited before the deadline.
    Drained,
    /// The deadline elapsed; `aborted` workers were still busy.
    DeadlineExceeded { aborted: usize },
}

/// Fixed-size set of tokio tasks pulling from one shared queue.
pub struct WorkerPool {
    size: usize,
    shared: Arc<WorkerShared>,
    handles: Vec<JoinHandle<()>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("started", &!self.handles.is_empty())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool of `size` workers. Nothing runs until [`WorkerPool::start`].
    pub fn new(size: usize, shared: Arc<WorkerShared>) -> Self {
        Self {
            size: size.max(1),
            shared,
            handles: Vec::new(),
        }
    }

    /// Spawn the workers. Calling start on a running pool is a no-op.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }
        for worker_id in 0..self.size {
            let shared = Arc::clone(&self.shared);
            self.handles
                .push(tokio::spawn(async move { worker_loop(worker_id, shared).await }));
        }
        tracing::info!(workers = self.size, "worker pool started");
    }

    /// Wait for every worker to exit, at most until `deadline` elapses.
    ///
    /// Workers leave their loop once the shared shutdown token is cancelled
    /// and their current task, if any, finished. At the deadline the per-task
    /// tokens are cancelled and the remaining workers are aborted and joined.
    pub async fn stop_and_wait(&mut self, deadline: Duration) -> PoolStopOutcome {
        let mut handles = std::mem::take(&mut self.handles);
        let joined = tokio::time::timeout(deadline, async {
            while let Some(handle) = handles.last_mut() {
                if let Err(err) = handle.await {
                    tracing::warn!("worker task failed: {err:?}");
                }
                // Joined handles must not be polled again.
                handles.pop();
            }
        })
        .await;

        if joined.is_ok() {
            return PoolStopOutcome::Drained;
        }

        let aborted = handles.iter().filter(|handle| !handle.is_finished()).count();
        self.shared.reporter.cancel_in_flight();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            match handle.await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => tracing::warn!("worker task failed: {err:?}"),
            }
        }
        tracing::warn!(aborted, "stop deadline elapsed, aborted busy workers");
        PoolStopOutcome::DeadlineExceeded { aborted }
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<WorkerShared>) {
    loop {
        let mut task = match shared.queue.dequeue(&shared.shutdown).await {
            Ok(task) => task,
            Err(err) => {
                tracing::debug!(worker = worker_id, "worker exiting: {err}");
                break;
            }
        };

        let Some(cancel) = shared.reporter.task_started(&mut task, worker_id) else {
            continue;
        };

        let timer = telemetry::record_task_start(task.id());
        let result = telemetry::instrument_dispatch(
            task.id(),
            task.kind(),
            worker_id,
            execute(&shared, &task, &cancel),
        )
        .await;
        let elapsed = timer.elapsed();
        tracing::trace!(
            task_id = %timer.task_id(),
            worker = worker_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "execution finished"
        );

        if matches!(result, Err(CollaboratorError::Cancelled))
            && cancel.is_cancelled()
            && shared.shutdown.is_cancelled()
        {
            // Interrupted by the stop deadline; left registered as running.
            break;
        }

        let mut sample = TaskSample {
            task_id: task.id(),
            kind: task.kind(),
            subject: task.subject().to_path_buf(),
            attempt: task.attempt(),
            outcome: SampleOutcome::Completed,
            duration: elapsed,
            error: None,
        };

        match result {
            Ok(output) => {
                shared.reporter.task_completed(task, output, elapsed);
            }
            Err(err) => {
                sample.error = Some(err.to_string());
                match shared.retry.decide(task.attempt(), &err) {
                    RetryDecision::Retry { delay } => {
                        sample.outcome = SampleOutcome::Retrying;
                        shared.reporter.task_retry(task, delay, &err, elapsed);
                    }
                    RetryDecision::GiveUp { reason } => {
                        sample.outcome = SampleOutcome::Failed;
                        shared.reporter.task_failed(task, reason, &err, elapsed);
                    }
                }
            }
        }

        record_sample(shared.sink.as_ref(), &sample);
    }
}

/// Run the task's handler under the task timeout, turning panics into
/// permanent failures.
async fn execute(
    shared: &WorkerShared,
    task: &Task,
    cancel: &ShutdownToken,
) -> Result<HandlerOutput, CollaboratorError> {
    let Some(handler) = shared.handlers.get(task.kind()) else {
        return Err(CollaboratorError::permanent(format!(
            "no handler registered for {}",
            task.kind()
        )));
    };

    let guarded = AssertUnwindSafe(handler.handle(task, cancel)).catch_unwind();
    match tokio::time::timeout(shared.task_timeout, guarded).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(task_id = %task.id(), panic = %message, "task handler panicked");
            Err(CollaboratorError::Panicked(message))
        }
        Err(_) => {
            cancel.cancel();
            Err(CollaboratorError::TimedOut(shared.task_timeout))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
