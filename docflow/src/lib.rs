//! Docflow - task orchestration core for document ingestion.
//!
//! Accepts parse, index, update and delete work for file paths, runs it on a
//! bounded pool of async workers in priority order, retries transient
//! failures with exponential backoff, and shuts down gracefully with full
//! accounting of every task it ever accepted.
//!
//! # Core Concepts
//!
//! - **Task**: A [`Task`] is one unit of work for one subject path. Parse and
//!   update tasks produce a document that a follow-on index task stores; the
//!   tasks of one submission form a chain sharing a [`ChainId`].
//!
//! - **Queue**: The [`PriorityQueue`] is a bounded in-memory queue ordered by
//!   [`Priority`], FIFO within equal priorities. Enqueue fails fast when full.
//!
//! - **Retry**: The [`RetryPolicy`] classifies collaborator errors and
//!   computes jittered exponential backoff between attempts.
//!
//! - **Collaborators**: [`Parser`], [`Storage`], [`ChangeSource`] and
//!   [`MetricsSink`] are the seams to the outside world. Handlers for each
//!   [`TaskKind`] live in a [`HandlerTable`].
//!
//! - **Events**: Every lifecycle transition is published on an
//!   [`InProcEventBus`] as a [`TaskEvent`].
//!
//! - **Runtime**: The [`Orchestrator`] ties everything together. Submissions
//!   for a subject with an active chain are coalesced or parked behind it, so
//!   at most one task per subject runs at a time.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use docflow::*;
//! use std::time::Duration;
//!
//! let engine = OrchestratorBuilder::new(EngineConfig::default())
//!     .with_parser(parser)
//!     .with_storage(storage)
//!     .build()?;
//! engine.start().await?;
//! engine.submit("notes/today.md", TaskKind::Parse, Priority::NORMAL)?;
//! let report = engine.stop(Duration::from_secs(5)).await?;
//! assert!(report.state.is_accounted());
//! ```

/// Collaborator traits and the per-kind task handlers.
///
/// The `collaborator` module defines the [`Parser`], [`Storage`],
/// [`ChangeSource`] and [`MetricsSink`] seams, the [`ParsedDocument`] that
/// flows between them, and the [`HandlerTable`] the workers dispatch through.
pub mod collaborator;

/// Engine configuration.
///
/// [`EngineConfig`] holds worker count, queue capacity, task timeout, retry
/// settings and the intervals the engine uses internally.
pub mod config;

/// Error types for submissions, the queue and collaborators.
pub mod error;

/// Task lifecycle events.
///
/// The `events` module provides [`TaskEvent`], its [`TaskEventPayload`], and
/// [`InProcEventBus`], a tokio broadcast channel that never blocks the engine.
pub mod events;

#[cfg(feature = "metrics")]
/// Prometheus metrics.
///
/// Available with the `metrics` feature. Counters and histograms are
/// registered in a crate-local registry exposed through
/// [`metrics::gather_metrics`].
pub mod metrics;

/// Bounded priority queue shared by the workers.
pub mod queue;

/// Retry classification and exponential backoff.
pub mod retry;

/// Runtime orchestration and worker management.
///
/// The `runtime` module provides the [`Orchestrator`] and its builder:
/// - [`Orchestrator`] - submission, start, stop and status
/// - [`OrchestratorBuilder`] - wires collaborators into an orchestrator
/// - [`ShutdownToken`] - cancellation signalling
/// - [`WorkerPool`] - the bounded set of workers
pub mod runtime;

/// Engine state, counters and the bookkeeping ledger.
pub mod state;

/// Task model: identifiers, kinds, priorities and the status state machine.
pub mod task;

/// Tracing spans and structured log helpers.
pub mod telemetry;

pub use collaborator::{
    ChangeEvent, ChangeKind, ChangeSource, DeleteHandler, HandlerOutput, HandlerTable,
    IndexHandler, MetricsSink, ParseHandler, ParsedDocument, Parser, SampleOutcome, Storage,
    TaskHandler, TaskSample, TracingMetricsSink,
};
#[cfg(feature = "metrics")]
pub use collaborator::PrometheusMetricsSink;
pub use config::*;
pub use error::{CollaboratorError, EngineError, QueueError, TaskStateError};
pub use events::{AbandonReason, EventMeta, InProcEventBus, TaskEvent, TaskEventPayload};
pub use queue::{PriorityQueue, Rejected};
pub use retry::{GiveUpReason, RetryConfig, RetryDecision, RetryPolicy};
pub use runtime::{
    ConsumeReport, Orchestrator, OrchestratorBuilder, ShutdownToken, StopOutcome, StopReport,
};
pub use state::{
    AbandonedTask, EngineState, EngineStatus, FailureRecord, StateLedger, TaskOutcome, TaskRecord,
};
pub use task::*;
