use std::time::Duration;

use docflow::{EngineState, Orchestrator, TaskEvent, TaskEventPayload};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{timeout, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `condition` until it holds or `limit` elapses. Returns whether it held.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Wait until the engine's snapshot satisfies `condition` and return it.
pub async fn wait_for_state(
    engine: &Orchestrator,
    limit: Duration,
    mut condition: impl FnMut(&EngineState) -> bool,
) -> Option<EngineState> {
    let mut last = None;
    let held = wait_until(limit, || {
        let state = engine.status();
        let ok = condition(&state);
        last = Some(state);
        ok
    })
    .await;
    if held {
        last
    } else {
        None
    }
}

/// Receive events until one matches `predicate`. Lagged gaps are skipped.
pub async fn next_matching(
    rx: &mut broadcast::Receiver<TaskEvent>,
    limit: Duration,
    mut predicate: impl FnMut(&TaskEvent) -> bool,
) -> Option<TaskEvent> {
    timeout(limit, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Wait until `count` chains have ended, collecting every event seen.
pub async fn collect_chains(
    rx: &mut broadcast::Receiver<TaskEvent>,
    count: usize,
    limit: Duration,
) -> Vec<TaskEvent> {
    let mut seen = Vec::new();
    let mut ended = 0;
    let _ = timeout(limit, async {
        while ended < count {
            match rx.recv().await {
                Ok(event) => {
                    if matches!(event.payload, TaskEventPayload::ChainCompleted { .. }) {
                        ended += 1;
                    }
                    seen.push(event);
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;
    seen
}
