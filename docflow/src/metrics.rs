//! Prometheus metrics for docflow, compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `docflow_tasks_submitted_total` - chains accepted by `submit`
//! - `docflow_tasks_finished_total` - execution attempts by outcome
//! - `docflow_tasks_abandoned_total` - tasks dropped at shutdown
//!
//! ## Gauges
//! - `docflow_queue_depth` - tasks waiting in the queue
//!
//! ## Histograms
//! - `docflow_task_duration_seconds` - execution time per attempt
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, Gauge, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Global Prometheus registry for docflow metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `task_kind`.
pub static TASKS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "docflow_tasks_submitted_total",
        "Total number of tasks accepted for execution",
    );
    CounterVec::new(opts, &["task_kind"])
        .expect("docflow_tasks_submitted_total metric creation failed")
});

/// Labels: `task_kind`, `outcome` (completed, retrying, failed).
pub static TASKS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "docflow_tasks_finished_total",
        "Total number of task execution attempts by outcome",
    );
    CounterVec::new(opts, &["task_kind", "outcome"])
        .expect("docflow_tasks_finished_total metric creation failed")
});

/// Labels: `task_kind`.
pub static TASKS_ABANDONED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "docflow_tasks_abandoned_total",
        "Total number of tasks abandoned during shutdown",
    );
    CounterVec::new(opts, &["task_kind"])
        .expect("docflow_tasks_abandoned_total metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("docflow_queue_depth", "Current number of queued tasks")
        .expect("docflow_queue_depth metric creation failed")
});

/// Labels: `task_kind`, `outcome`.
pub static TASK_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "docflow_task_duration_seconds",
        "Task execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["task_kind", "outcome"])
        .expect("docflow_task_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(TASKS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(TASKS_FINISHED_TOTAL.clone()),
        Box::new(TASKS_ABANDONED_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(TASK_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

/// Count an accepted task.
pub fn record_task_submitted(task_kind: &str) {
    TASKS_SUBMITTED_TOTAL.with_label_values(&[task_kind]).inc();
}

/// Count a finished execution attempt.
pub fn record_task_finished(task_kind: &str, outcome: &str) {
    TASKS_FINISHED_TOTAL
        .with_label_values(&[task_kind, outcome])
        .inc();
}

/// Count a task abandoned at shutdown.
pub fn record_task_abandoned(task_kind: &str) {
    TASKS_ABANDONED_TOTAL.with_label_values(&[task_kind]).inc();
}

/// Set the queue depth gauge.
pub fn set_queue_depth(depth: f64) {
    QUEUE_DEPTH.set(depth);
}

/// Record how long an execution attempt took.
pub fn observe_task_duration(task_kind: &str, outcome: &str, duration_secs: f64) {
    TASK_DURATION_SECONDS
        .with_label_values(&[task_kind, outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
