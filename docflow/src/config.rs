use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::retry::RetryConfig;

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 50;
pub const MAX_QUEUE_CAPACITY: usize = 1_000_000;

/// Engine configuration.
///
/// Every field has a default, so a partial JSON document only needs to name
/// the values it overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// Maximum number of queued tasks.
    pub queue_capacity: usize,
    /// Per-attempt execution limit in milliseconds.
    pub task_timeout_ms: u64,
    pub retry: RetryConfig,
    /// Retry interval for delayed enqueues that found the queue full, and for
    /// change-source backpressure.
    pub requeue_interval_ms: u64,
    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
    /// Number of terminal task records kept for `history()`.
    pub history_capacity: usize,
    /// Consecutive terminal failures before the engine reports Degraded.
    pub degraded_after_failures: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            task_timeout_ms: 60_000,
            retry: RetryConfig::default(),
            requeue_interval_ms: 50,
            event_capacity: 1024,
            history_capacity: 256,
            degraded_after_failures: 10,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(raw).context("failed to parse engine config")?;
        config.validate().context("engine config rejected")?;
        Ok(config)
    }

    /// Check every setting against its allowed range.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.workers) {
            return Err(EngineError::Config(format!(
                "workers must be between {MIN_WORKERS} and {MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if !(1..=MAX_QUEUE_CAPACITY).contains(&self.queue_capacity) {
            return Err(EngineError::Config(format!(
                "queue_capacity must be between 1 and {MAX_QUEUE_CAPACITY}, got {}",
                self.queue_capacity
            )));
        }
        if self.task_timeout_ms == 0 {
            return Err(EngineError::Config("task_timeout_ms must be positive".into()));
        }
        if self.requeue_interval_ms == 0 {
            return Err(EngineError::Config("requeue_interval_ms must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(EngineError::Config("event_capacity must be positive".into()));
        }
        if self.degraded_after_failures == 0 {
            return Err(EngineError::Config(
                "degraded_after_failures must be positive".into(),
            ));
        }
        self.retry.validate()
    }

    /// Set the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the per-task execution timeout.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set how long a deferred enqueue waits before trying a full queue again.
    pub fn with_requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set how many terminal task records are kept.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set how many consecutive terminal failures mark the engine degraded.
    pub fn with_degraded_after_failures(mut self, failures: u32) -> Self {
        self.degraded_after_failures = failures;
        self
    }

    /// Per-task execution timeout.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Wait between attempts to enqueue into a full queue.
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_millis(self.requeue_interval_ms)
    }
}
