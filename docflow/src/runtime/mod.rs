/// Builder wiring collaborators into an orchestrator.
pub mod builder;
/// Engine supervision: submissions, dedup, retries and graceful shutdown.
pub mod supervisor;
/// Worker pool and task execution.
pub mod worker;

pub use builder::OrchestratorBuilder;
pub use supervisor::{ConsumeReport, Orchestrator, ShutdownToken, StopOutcome, StopReport};
pub use worker::{PoolStopOutcome, TaskReporter, WorkerPool, WorkerShared};
