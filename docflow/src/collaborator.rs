use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CollaboratorError;
use crate::runtime::ShutdownToken;
use crate::task::{Priority, Task, TaskId, TaskKind, TaskPayload};

/// Structured output of a successful parse.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub path: PathBuf,
    pub content: String,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

impl ParsedDocument {
    /// Create a document with empty metadata.
    pub fn new(
        path: impl Into<PathBuf>,
        content: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            content_type: content_type.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Extracts a structured document from a file.
///
/// Implementations should observe `cancel` at their own await points; the
/// engine cancels it when the task times out or shutdown hits its deadline.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(
        &self,
        path: &Path,
        cancel: &ShutdownToken,
    ) -> Result<ParsedDocument, CollaboratorError>;
}

/// Persists and removes documents. Both operations must be idempotent since
/// the engine retries them after transient failures.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn store(
        &self,
        document: &ParsedDocument,
        cancel: &ShutdownToken,
    ) -> Result<(), CollaboratorError>;

    async fn delete(&self, path: &Path, cancel: &ShutdownToken) -> Result<(), CollaboratorError>;
}

/// File-system change reported by a watcher.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

impl ChangeKind {
    /// The task kind that starts the chain for this change.
    pub fn task_kind(&self) -> TaskKind {
        match self {
            ChangeKind::Created => TaskKind::Parse,
            ChangeKind::Modified => TaskKind::Update,
            ChangeKind::Removed => TaskKind::Delete,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    #[serde(default)]
    pub priority: Priority,
}

impl ChangeEvent {
    /// Create a change at the default priority.
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            priority: Priority::NORMAL,
        }
    }

    /// Override the priority the resulting task is submitted with.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Stream of change events, already debounced by the producer.
///
/// Returning `None` ends the stream.
#[async_trait]
pub trait ChangeSource: Send {
    async fn next_change(&mut self) -> Option<ChangeEvent>;
}

#[async_trait]
impl ChangeSource for mpsc::Receiver<ChangeEvent> {
    async fn next_change(&mut self) -> Option<ChangeEvent> {
        self.recv().await
    }
}

#[async_trait]
impl ChangeSource for mpsc::UnboundedReceiver<ChangeEvent> {
    async fn next_change(&mut self) -> Option<ChangeEvent> {
        self.recv().await
    }
}

/// Result of one task execution as seen by a metrics sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    Completed,
    Retrying,
    Failed,
}

impl SampleOutcome {
    /// Label used in logs and metric series.
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleOutcome::Completed => "completed",
            SampleOutcome::Retrying => "retrying",
            SampleOutcome::Failed => "failed",
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskSample {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub subject: PathBuf,
    pub attempt: u32,
    pub outcome: SampleOutcome,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Receives one sample per task execution.
///
/// Errors and panics inside a sink are logged and otherwise ignored; a broken
/// sink never affects task processing.
pub trait MetricsSink: Send + Sync {
    fn record(&self, sample: &TaskSample) -> anyhow::Result<()>;
}

/// Sink that writes every sample to the tracing log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, sample: &TaskSample) -> anyhow::Result<()> {
        crate::telemetry::record_task_sample(sample);
        Ok(())
    }
}

/// Sink that feeds the Prometheus collectors in [`crate::metrics`].
#[cfg(feature = "metrics")]
#[derive(Clone, Copy, Debug, Default)]
pub struct PrometheusMetricsSink;

#[cfg(feature = "metrics")]
impl MetricsSink for PrometheusMetricsSink {
    fn record(&self, sample: &TaskSample) -> anyhow::Result<()> {
        crate::metrics::record_task_finished(sample.kind.as_str(), sample.outcome.as_str());
        crate::metrics::observe_task_duration(
            sample.kind.as_str(),
            sample.outcome.as_str(),
            sample.duration.as_secs_f64(),
        );
        Ok(())
    }
}

/// Deliver `sample` to `sink`, swallowing errors and panics.
pub(crate) fn record_sample(sink: &dyn MetricsSink, sample: &TaskSample) {
    match std::panic::catch_unwind(AssertUnwindSafe(|| sink.record(sample))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::warn!(task_id = %sample.task_id, error = %err, "metrics sink rejected sample");
        }
        Err(_) => {
            tracing::warn!(task_id = %sample.task_id, "metrics sink panicked");
        }
    }
}

/// Output of a handler. Document-producing kinds return the parsed document
/// so the engine can hand it to the chain's Index task.
#[derive(Clone, Debug, Default)]
pub struct HandlerOutput {
    pub payload: Option<TaskPayload>,
}

impl HandlerOutput {
    /// Output of a task that produces nothing.
    pub fn empty() -> Self {
        Self { payload: None }
    }

    /// Output carrying a parsed document for the index step.
    pub fn document(document: ParsedDocument) -> Self {
        Self {
            payload: Some(TaskPayload::Document(Arc::new(document))),
        }
    }
}

/// Executes one task kind.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(
        &self,
        task: &Task,
        cancel: &ShutdownToken,
    ) -> Result<HandlerOutput, CollaboratorError>;
}

/// Runs Parse and Update tasks through a [`Parser`].
pub struct ParseHandler {
    parser: Arc<dyn Parser>,
}

impl ParseHandler {
    /// Wrap a parser.
    pub fn new(parser: Arc<dyn Parser>) -> Self {
        Self { parser }
    }
}

#[async_trait]
impl TaskHandler for ParseHandler {
    async fn handle(
        &self,
        task: &Task,
        cancel: &ShutdownToken,
    ) -> Result<HandlerOutput, CollaboratorError> {
        let document = self.parser.parse(task.subject(), cancel).await?;
        Ok(HandlerOutput::document(document))
    }
}

/// Runs Index tasks by storing the payload carried over from the parse.
pub struct IndexHandler {
    storage: Arc<dyn Storage>,
}

impl IndexHandler {
    /// Wrap a storage backend.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TaskHandler for IndexHandler {
    async fn handle(
        &self,
        task: &Task,
        cancel: &ShutdownToken,
    ) -> Result<HandlerOutput, CollaboratorError> {
        let payload = task
            .payload()
            .ok_or_else(|| CollaboratorError::permanent("index task carries no document"))?;
        self.storage.store(payload.document(), cancel).await?;
        Ok(HandlerOutput::empty())
    }
}

/// Runs Delete tasks through [`Storage::delete`].
pub struct DeleteHandler {
    storage: Arc<dyn Storage>,
}

impl DeleteHandler {
    /// Wrap a storage backend.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TaskHandler for DeleteHandler {
    async fn handle(
        &self,
        task: &Task,
        cancel: &ShutdownToken,
    ) -> Result<HandlerOutput, CollaboratorError> {
        self.storage.delete(task.subject(), cancel).await?;
        Ok(HandlerOutput::empty())
    }
}

/// Handlers keyed by task kind.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: BTreeMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the standard table: the parser serves Parse and Update, the
    /// storage serves Index and Delete.
    pub fn from_collaborators(
        parser: Option<Arc<dyn Parser>>,
        storage: Option<Arc<dyn Storage>>,
    ) -> Self {
        let mut table = Self::new();
        if let Some(parser) = parser {
            let handler: Arc<dyn TaskHandler> = Arc::new(ParseHandler::new(parser));
            table.insert(TaskKind::Parse, Arc::clone(&handler));
            table.insert(TaskKind::Update, handler);
        }
        if let Some(storage) = storage {
            table.insert(TaskKind::Index, Arc::new(IndexHandler::new(Arc::clone(&storage))));
            table.insert(TaskKind::Delete, Arc::new(DeleteHandler::new(storage)));
        }
        table
    }

    /// Register or replace the handler for a kind.
    pub fn insert(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Builder-style [`HandlerTable::insert`].
    pub fn with_handler(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.insert(kind, handler);
        self
    }

    /// Handler registered for a kind.
    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Whether a handler is registered for this kind.
    pub fn supports(&self, kind: TaskKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Whether every step of a chain starting with `kind` has a handler.
    pub fn supports_chain(&self, kind: TaskKind) -> bool {
        if !self.supports(kind) {
            return false;
        }
        !kind.produces_document() || self.supports(TaskKind::Index)
    }

    /// Kinds with a registered handler.
    pub fn kinds(&self) -> impl Iterator<Item = TaskKind> + '_ {
        self.handlers.keys().copied()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticParser;

    #[async_trait]
    impl Parser for StaticParser {
        async fn parse(
            &self,
            path: &Path,
            _cancel: &ShutdownToken,
        ) -> Result<ParsedDocument, CollaboratorError> {
            Ok(ParsedDocument::new(path, "hello", "text/plain"))
        }
    }

    struct FailingSink;

    impl MetricsSink for FailingSink {
        fn record(&self, _sample: &TaskSample) -> anyhow::Result<()> {
            anyhow::bail!("sink offline")
        }
    }

    struct PanickingSink;

    impl MetricsSink for PanickingSink {
        fn record(&self, _sample: &TaskSample) -> anyhow::Result<()> {
            panic!("sink exploded")
        }
    }

    fn sample() -> TaskSample {
        TaskSample {
            task_id: TaskId::new(),
            kind: TaskKind::Parse,
            subject: PathBuf::from("a.md"),
            attempt: 1,
            outcome: SampleOutcome::Completed,
            duration: Duration::from_millis(3),
            error: None,
        }
    }

    #[test]
    fn test_change_kind_mapping() {
        assert_eq!(ChangeKind::Created.task_kind(), TaskKind::Parse);
        assert_eq!(ChangeKind::Modified.task_kind(), TaskKind::Update);
        assert_eq!(ChangeKind::Removed.task_kind(), TaskKind::Delete);
    }

    #[test]
    fn test_handler_table_chain_support() {
        let table = HandlerTable::from_collaborators(Some(Arc::new(StaticParser)), None);
        assert!(table.supports(TaskKind::Parse));
        assert!(table.supports(TaskKind::Update));
        assert!(!table.supports_chain(TaskKind::Parse));
        assert!(!table.supports(TaskKind::Delete));
    }

    #[test]
    fn test_broken_sinks_are_ignored() {
        record_sample(&FailingSink, &sample());
        record_sample(&PanickingSink, &sample());
        record_sample(&TracingMetricsSink, &sample());
    }

    #[tokio::test]
    async fn test_parse_handler_returns_document_payload() {
        let handler = ParseHandler::new(Arc::new(StaticParser));
        let task = Task::new(TaskKind::Parse, "notes/a.md", Priority::NORMAL);
        let output = handler
            .handle(&task, &ShutdownToken::new())
            .await
            .unwrap();
        let payload = output.payload.expect("parse yields a document");
        assert_eq!(payload.document().path, PathBuf::from("notes/a.md"));
    }

    #[tokio::test]
    async fn test_index_without_payload_is_permanent() {
        struct NullStorage;

        #[async_trait]
        impl Storage for NullStorage {
            async fn store(
                &self,
                _document: &ParsedDocument,
                _cancel: &ShutdownToken,
            ) -> Result<(), CollaboratorError> {
                Ok(())
            }

            async fn delete(
                &self,
                _path: &Path,
                _cancel: &ShutdownToken,
            ) -> Result<(), CollaboratorError> {
                Ok(())
            }
        }

        let handler = IndexHandler::new(Arc::new(NullStorage));
        let task = Task::new(TaskKind::Index, "a.md", Priority::NORMAL);
        let err = handler
            .handle(&task, &ShutdownToken::new())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_channel_change_source() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(ChangeEvent::new("a.md", ChangeKind::Created))
            .await
            .unwrap();
        drop(tx);
        let event = rx.next_change().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Created);
        assert!(rx.next_change().await.is_none());
    }
}
