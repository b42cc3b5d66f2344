use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use docflow::*;
use parking_lot::Mutex;

/// Failure a fake collaborator injects instead of succeeding.
#[derive(Clone, Debug, PartialEq)]
pub enum FakeFailure {
    Transient(String),
    Permanent(String),
    Panic(String),
}

impl FakeFailure {
    pub fn transient() -> Self {
        FakeFailure::Transient("fake transient failure".into())
    }

    pub fn permanent() -> Self {
        FakeFailure::Permanent("fake permanent failure".into())
    }

    fn raise(&self) -> CollaboratorError {
        match self {
            FakeFailure::Transient(message) => CollaboratorError::transient(message.clone()),
            FakeFailure::Permanent(message) => CollaboratorError::permanent(message.clone()),
            FakeFailure::Panic(message) => panic!("{message}"),
        }
    }
}

#[derive(Clone, Debug)]
struct Scripted {
    /// `None` fails forever.
    remaining: Option<u32>,
    failure: FakeFailure,
}

/// Per-path failure script shared by the fakes.
#[derive(Clone, Debug, Default)]
struct FailureScript {
    entries: Arc<Mutex<HashMap<PathBuf, Scripted>>>,
}

impl FailureScript {
    fn set(&self, path: PathBuf, remaining: Option<u32>, failure: FakeFailure) {
        self.entries
            .lock()
            .insert(path, Scripted { remaining, failure });
    }

    /// Failure to inject for this call, consuming one scripted attempt.
    fn next(&self, path: &Path) -> Option<FakeFailure> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(path)?;
        match entry.remaining {
            None => Some(entry.failure.clone()),
            Some(0) => None,
            Some(ref mut remaining) => {
                *remaining -= 1;
                Some(entry.failure.clone())
            }
        }
    }
}

/// Collaborator operation recorded on a [`Timeline`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Op {
    ParseStarted,
    ParseFinished,
    Stored,
    Deleted,
}

#[derive(Clone, Debug)]
pub struct TimelineEntry {
    pub path: PathBuf,
    pub op: Op,
    pub at: Instant,
}

/// Ordered log of collaborator calls, shareable between fakes.
#[derive(Clone, Debug, Default)]
pub struct Timeline {
    entries: Arc<Mutex<Vec<TimelineEntry>>>,
    active: Arc<Mutex<HashMap<PathBuf, usize>>>,
    overlaps: Arc<Mutex<Vec<PathBuf>>>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, path: &Path, op: Op) {
        self.entries.lock().push(TimelineEntry {
            path: path.to_path_buf(),
            op,
            at: Instant::now(),
        });
    }

    fn enter(&self, path: &Path) {
        let mut active = self.active.lock();
        let count = active.entry(path.to_path_buf()).or_default();
        *count += 1;
        if *count > 1 {
            self.overlaps.lock().push(path.to_path_buf());
        }
    }

    fn exit(&self, path: &Path) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(path) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.entries.lock().clone()
    }

    pub fn ops_for(&self, path: impl AsRef<Path>) -> Vec<Op> {
        let path = path.as_ref();
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.path == path)
            .map(|entry| entry.op)
            .collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.entries.lock().iter().filter(|entry| entry.op == op).count()
    }

    /// Subjects that ever had two collaborator calls in flight at once.
    pub fn overlapping_subjects(&self) -> Vec<PathBuf> {
        self.overlaps.lock().clone()
    }

    pub fn assert_no_overlap(&self) {
        let overlaps = self.overlapping_subjects();
        assert!(
            overlaps.is_empty(),
            "Expected at most one call per subject in flight, overlapping: {overlaps:?}"
        );
    }
}

/// Decrements the active count for a subject when the call ends, including
/// by panic or cancellation.
struct ActiveGuard<'a> {
    timeline: &'a Timeline,
    path: &'a Path,
}

impl<'a> ActiveGuard<'a> {
    fn enter(timeline: &'a Timeline, path: &'a Path) -> Self {
        timeline.enter(path);
        Self { timeline, path }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.timeline.exit(self.path);
    }
}

/// Sleep for `delay` unless `cancel` fires first.
async fn pause(delay: Duration, cancel: &ShutdownToken) -> Result<(), CollaboratorError> {
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(CollaboratorError::Cancelled),
    }
}

/// In-memory parser returning a document built from the path.
#[derive(Clone, Debug, Default)]
pub struct FakeParser {
    delay: Arc<Mutex<Duration>>,
    script: FailureScript,
    timeline: Timeline,
    calls: Arc<Mutex<Vec<(PathBuf, Instant)>>>,
}

impl FakeParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    /// Fail the next `times` parses of `path`, then succeed.
    pub fn fail_times(&self, path: impl Into<PathBuf>, times: u32, failure: FakeFailure) {
        self.script.set(path.into(), Some(times), failure);
    }

    /// Fail every parse of `path`.
    pub fn fail_always(&self, path: impl Into<PathBuf>, failure: FakeFailure) {
        self.script.set(path.into(), None, failure);
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, path: impl AsRef<Path>) -> Vec<Instant> {
        let path = path.as_ref();
        self.calls
            .lock()
            .iter()
            .filter(|(called, _)| called == path)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(actual, expected, "Expected {expected} parses, got {actual}");
    }
}

#[async_trait]
impl Parser for FakeParser {
    async fn parse(
        &self,
        path: &Path,
        cancel: &ShutdownToken,
    ) -> Result<ParsedDocument, CollaboratorError> {
        self.calls.lock().push((path.to_path_buf(), Instant::now()));
        let _active = ActiveGuard::enter(&self.timeline, path);
        self.timeline.push(path, Op::ParseStarted);

        let delay = *self.delay.lock();
        pause(delay, cancel).await?;

        if let Some(failure) = self.script.next(path) {
            return Err(failure.raise());
        }

        self.timeline.push(path, Op::ParseFinished);
        Ok(ParsedDocument::new(
            path,
            format!("contents of {}", path.display()),
            "text/plain",
        )
        .with_metadata("source", "fake"))
    }
}

/// In-memory storage keeping every stored document by path.
#[derive(Clone, Debug, Default)]
pub struct FakeStorage {
    delay: Arc<Mutex<Duration>>,
    script: FailureScript,
    timeline: Timeline,
    documents: Arc<Mutex<HashMap<PathBuf, ParsedDocument>>>,
    stores: Arc<Mutex<Vec<PathBuf>>>,
    deletes: Arc<Mutex<Vec<PathBuf>>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeline(mut self, timeline: Timeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    /// Fail the next `times` store or delete calls for `path`.
    pub fn fail_times(&self, path: impl Into<PathBuf>, times: u32, failure: FakeFailure) {
        self.script.set(path.into(), Some(times), failure);
    }

    pub fn fail_always(&self, path: impl Into<PathBuf>, failure: FakeFailure) {
        self.script.set(path.into(), None, failure);
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn document(&self, path: impl AsRef<Path>) -> Option<ParsedDocument> {
        self.documents.lock().get(path.as_ref()).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.documents.lock().len()
    }

    pub fn stores(&self) -> Vec<PathBuf> {
        self.stores.lock().clone()
    }

    pub fn deletes(&self) -> Vec<PathBuf> {
        self.deletes.lock().clone()
    }
}

#[async_trait]
impl Storage for FakeStorage {
    async fn store(
        &self,
        document: &ParsedDocument,
        cancel: &ShutdownToken,
    ) -> Result<(), CollaboratorError> {
        let path = document.path.as_path();
        let _active = ActiveGuard::enter(&self.timeline, path);
        let delay = *self.delay.lock();
        pause(delay, cancel).await?;

        if let Some(failure) = self.script.next(path) {
            return Err(failure.raise());
        }

        self.timeline.push(path, Op::Stored);
        self.stores.lock().push(path.to_path_buf());
        self.documents
            .lock()
            .insert(path.to_path_buf(), document.clone());
        Ok(())
    }

    async fn delete(&self, path: &Path, cancel: &ShutdownToken) -> Result<(), CollaboratorError> {
        let _active = ActiveGuard::enter(&self.timeline, path);
        let delay = *self.delay.lock();
        pause(delay, cancel).await?;

        if let Some(failure) = self.script.next(path) {
            return Err(failure.raise());
        }

        self.timeline.push(path, Op::Deleted);
        self.deletes.lock().push(path.to_path_buf());
        self.documents.lock().remove(path);
        Ok(())
    }
}

/// Metrics sink keeping every sample it receives.
#[derive(Clone, Debug, Default)]
pub struct RecordingMetrics {
    samples: Arc<Mutex<Vec<TaskSample>>>,
    failing: bool,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose `record` always errors after storing the sample.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn samples(&self) -> Vec<TaskSample> {
        self.samples.lock().clone()
    }

    pub fn count(&self, outcome: SampleOutcome) -> usize {
        self.samples
            .lock()
            .iter()
            .filter(|sample| sample.outcome == outcome)
            .count()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, sample: &TaskSample) -> anyhow::Result<()> {
        self.samples.lock().push(sample.clone());
        if self.failing {
            anyhow::bail!("recording sink configured to fail");
        }
        Ok(())
    }
}
