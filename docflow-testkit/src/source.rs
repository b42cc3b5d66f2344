use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use docflow::{ChangeEvent, ChangeKind, ChangeSource};

/// Change source replaying a fixed list of events, optionally spaced out.
#[derive(Clone, Debug, Default)]
pub struct ScriptedChanges {
    events: VecDeque<ChangeEvent>,
    gap: Duration,
}

impl ScriptedChanges {
    pub fn new(events: impl IntoIterator<Item = ChangeEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
            gap: Duration::ZERO,
        }
    }

    /// One change of `kind` per path.
    pub fn uniform<P: Into<PathBuf>>(paths: impl IntoIterator<Item = P>, kind: ChangeKind) -> Self {
        Self::new(paths.into_iter().map(|path| ChangeEvent::new(path, kind)))
    }

    pub fn with_gap(mut self, gap: Duration) -> Self {
        self.gap = gap;
        self
    }

    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

#[async_trait]
impl ChangeSource for ScriptedChanges {
    async fn next_change(&mut self) -> Option<ChangeEvent> {
        if !self.gap.is_zero() {
            tokio::time::sleep(self.gap).await;
        }
        self.events.pop_front()
    }
}

/// Paths `prefix/0.ext` through `prefix/{count - 1}.ext`.
pub fn numbered_paths(prefix: &str, ext: &str, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| PathBuf::from(format!("{prefix}/{i}.{ext}")))
        .collect()
}
