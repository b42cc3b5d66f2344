use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collaborator::ParsedDocument;
use crate::error::TaskStateError;

/// Unique identifier for a task. Generated at creation and never reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskId {
    /// Generate a new time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier shared by every task of one Parse → Index chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub Uuid);

impl Default for ChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainId {
    /// Generate a new time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of work a task performs. Determines which handler executes it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Parse,
    Index,
    Update,
    Delete,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Parse,
        TaskKind::Index,
        TaskKind::Update,
        TaskKind::Delete,
    ];

    /// Label used in logs and metric series.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Parse => "parse",
            TaskKind::Index => "index",
            TaskKind::Update => "update",
            TaskKind::Delete => "delete",
        }
    }

    /// Kinds that run through the parser and hand a document to an Index task.
    pub fn produces_document(&self) -> bool {
        matches!(self, TaskKind::Parse | TaskKind::Update)
    }

    /// Whether an external caller may start a chain with this kind.
    pub fn is_submittable(&self) -> bool {
        !matches!(self, TaskKind::Index)
    }
}

impl Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Lower values dequeue first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const URGENT: Priority = Priority(0);
    pub const HIGH: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(50);
    pub const LOW: Priority = Priority(100);

    /// Returns true when `self` would dequeue before `other`.
    pub fn is_more_urgent_than(&self, other: Priority) -> bool {
        self.0 < other.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl TaskStatus {
    /// Label used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
        }
    }

    /// Check if the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data produced by one task of a chain and consumed by the next.
///
/// Moved from the finished task into its successor; never handed to a task
/// of another chain.
#[derive(Clone, Debug)]
pub enum TaskPayload {
    Document(Arc<ParsedDocument>),
}

impl TaskPayload {
    /// Parsed document carried to the index step.
    pub fn document(&self) -> &ParsedDocument {
        match self {
            TaskPayload::Document(doc) => doc,
        }
    }
}

/// One unit of orchestrated work plus its execution state.
#[derive(Clone, Debug)]
pub struct Task {
    id: TaskId,
    chain: ChainId,
    kind: TaskKind,
    subject: PathBuf,
    priority: Priority,
    status: TaskStatus,
    attempt: u32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    payload: Option<TaskPayload>,
}

impl Task {
    /// Create the first task of a new chain.
    pub fn new(kind: TaskKind, subject: impl Into<PathBuf>, priority: Priority) -> Self {
        Self {
            id: TaskId::new(),
            chain: ChainId::new(),
            kind,
            subject: subject.into(),
            priority,
            status: TaskStatus::Pending,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            payload: None,
        }
    }

    /// Create the next task of this chain, inheriting subject and priority.
    pub fn successor(&self, kind: TaskKind, payload: Option<TaskPayload>) -> Self {
        Self {
            id: TaskId::new(),
            chain: self.chain,
            kind,
            subject: self.subject.clone(),
            priority: self.priority,
            status: TaskStatus::Pending,
            attempt: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            payload,
        }
    }

    /// Task identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Chain this task belongs to.
    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// What the task does.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Path the task is about.
    pub fn subject(&self) -> &Path {
        &self.subject
    }

    /// Current priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Executions started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the task was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the latest execution started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// When the task reached a terminal status.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Error from the latest failed execution.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Payload handed over from the previous task in the chain.
    pub fn payload(&self) -> Option<&TaskPayload> {
        self.payload.as_ref()
    }

    /// Raise the priority. Only pending tasks can be promoted and a promotion
    /// never makes a task less urgent.
    pub fn promote(&mut self, priority: Priority) -> bool {
        if self.status == TaskStatus::Pending && priority.is_more_urgent_than(self.priority) {
            self.priority = priority;
            return true;
        }
        false
    }

    /// Pending to Running, counting one more attempt.
    pub fn mark_running(&mut self) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::Pending, TaskStatus::Running)?;
        self.attempt = self.attempt.saturating_add(1);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running to Completed.
    pub fn mark_completed(&mut self) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::Running, TaskStatus::Completed)?;
        self.completed_at = Some(Utc::now());
        self.last_error = None;
        Ok(())
    }

    /// Running to Retrying, keeping the error.
    pub fn mark_retrying(&mut self, error: impl Into<String>) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::Running, TaskStatus::Retrying)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Retrying back to Pending once the retry delay elapsed.
    pub fn mark_pending(&mut self) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::Retrying, TaskStatus::Pending)
    }

    /// Running to Failed, keeping the error.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TaskStateError> {
        self.transition(TaskStatus::Running, TaskStatus::Failed)?;
        self.completed_at = Some(Utc::now());
        self.last_error = Some(error.into());
        Ok(())
    }

    fn transition(&mut self, from: TaskStatus, to: TaskStatus) -> Result<(), TaskStateError> {
        if self.status != from {
            return Err(TaskStateError {
                task_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Lowercase file extension of the subject, `"no_extension"` when absent.
    pub fn extension(&self) -> String {
        self.subject
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_else(|| "no_extension".to_string())
    }
}
