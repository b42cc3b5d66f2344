//! Graceful shutdown tests: deadlines, abandonment and the accounting of
//! every task the engine accepted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use docflow::*;
use docflow_testkit::{
    next_matching, numbered_paths, wait_for_state, FakeFailure, FakeParser, FakeStorage,
};

const WAIT: Duration = Duration::from_secs(10);

fn engine(config: EngineConfig, parser: FakeParser, storage: FakeStorage) -> Orchestrator {
    OrchestratorBuilder::new(config)
        .with_parser(Arc::new(parser))
        .with_storage(Arc::new(storage))
        .build()
        .expect("build engine")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tiny_deadline_returns_promptly_and_accounts_everything() {
    let engine = engine(
        EngineConfig::default().with_workers(2),
        FakeParser::new().with_delay(Duration::from_secs(30)),
        FakeStorage::new(),
    );
    engine.start().await.unwrap();
    for path in numbered_paths("stuck", "pdf", 8) {
        engine.submit(path, TaskKind::Parse, Priority::NORMAL).unwrap();
    }
    wait_for_state(&engine, WAIT, |state| state.workers_busy == 2)
        .await
        .expect("both workers busy");

    let started = Instant::now();
    let err = engine.stop(Duration::from_millis(20)).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        err,
        EngineError::StopDeadlineExceeded {
            running: 2,
            abandoned: 6
        }
    );

    let state = engine.status();
    assert_eq!(state.status, EngineStatus::Stopped);
    assert_eq!(state.tasks_total, 8);
    assert_eq!(state.tasks_running_at_shutdown, 2);
    assert_eq!(state.tasks_abandoned, 6);
    assert_eq!(state.workers_busy, 0);
    assert!(state.is_accounted());
    assert!(state.stopped_at.is_some());

    let interrupted = engine
        .history()
        .into_iter()
        .filter(|record| record.outcome == TaskOutcome::RunningAtShutdown)
        .count();
    assert_eq!(interrupted, 2);
}

#[tokio::test]
async fn running_tasks_finish_and_successors_are_abandoned() {
    let storage = FakeStorage::new();
    let engine = engine(
        EngineConfig::default().with_workers(2),
        FakeParser::new().with_delay(Duration::from_millis(50)),
        storage.clone(),
    );
    engine.start().await.unwrap();
    engine.submit("a.md", TaskKind::Parse, Priority::NORMAL).unwrap();
    engine.submit("b.md", TaskKind::Parse, Priority::NORMAL).unwrap();
    wait_for_state(&engine, WAIT, |state| state.workers_busy == 2)
        .await
        .expect("both parses running");

    let report = engine.stop(Duration::from_secs(5)).await.expect("drained");
    assert_eq!(report.outcome, StopOutcome::Drained);
    assert!(report.running_at_shutdown.is_empty());
    assert_eq!(report.state.tasks_total, 4);
    assert_eq!(report.state.tasks_completed, 2);
    assert_eq!(report.state.tasks_abandoned, 2);
    assert!(report.state.is_accounted());
    assert!(report
        .abandoned
        .iter()
        .all(|task| task.kind == TaskKind::Index && task.reason == AbandonReason::Successor));
    assert_eq!(storage.document_count(), 0);
}

#[tokio::test]
async fn retrying_task_is_abandoned_at_stop() {
    let parser = FakeParser::new();
    parser.fail_always("flaky.md", FakeFailure::transient());
    let config = EngineConfig::default().with_retry(RetryConfig {
        base_delay_ms: 10_000,
        max_delay_ms: 30_000,
        ..RetryConfig::default()
    });
    let engine = engine(config, parser, FakeStorage::new());
    let mut events = engine.subscribe();
    engine.start().await.unwrap();

    let id = engine.submit("flaky.md", TaskKind::Parse, Priority::NORMAL).unwrap();
    wait_for_state(&engine, WAIT, |state| state.tasks_retrying == 1)
        .await
        .expect("retry scheduled");

    let report = engine.stop(Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.state.tasks_retrying, 0);
    assert_eq!(report.state.tasks_abandoned, 1);
    assert!(report.state.is_accounted());
    assert_eq!(report.abandoned[0].task_id, id);
    assert_eq!(report.abandoned[0].reason, AbandonReason::Delayed);

    let abandoned = next_matching(&mut events, WAIT, |event| {
        matches!(event.payload, TaskEventPayload::Abandoned { .. })
    })
    .await
    .expect("abandoned event");
    assert_eq!(abandoned.task_id(), id);
}

#[tokio::test]
async fn parked_follow_ups_are_abandoned() {
    let engine = engine(
        EngineConfig::default().with_workers(1),
        FakeParser::new().with_delay(Duration::from_millis(200)),
        FakeStorage::new(),
    );
    engine.start().await.unwrap();
    engine.submit("doc.md", TaskKind::Parse, Priority::NORMAL).unwrap();
    wait_for_state(&engine, WAIT, |state| state.workers_busy == 1)
        .await
        .expect("parse running");
    let delete = engine
        .submit("doc.md", TaskKind::Delete, Priority::NORMAL)
        .unwrap();
    engine.submit("other.md", TaskKind::Parse, Priority::NORMAL).unwrap();

    let report = engine.stop(Duration::from_secs(5)).await.unwrap();
    assert!(report.state.is_accounted());
    assert_eq!(report.state.tasks_completed, 1);
    let follow_up = report
        .abandoned
        .iter()
        .find(|task| task.task_id == delete)
        .expect("follow-up abandoned");
    assert_eq!(follow_up.reason, AbandonReason::FollowUp);
    assert!(report
        .abandoned
        .iter()
        .any(|task| task.reason == AbandonReason::Queued));
}

#[tokio::test]
async fn stop_before_start_then_everything_is_refused() {
    let engine = engine(EngineConfig::default(), FakeParser::new(), FakeStorage::new());
    for path in numbered_paths("never", "md", 3) {
        engine.submit(path, TaskKind::Parse, Priority::NORMAL).unwrap();
    }

    let report = engine.stop(Duration::from_millis(10)).await.unwrap();
    assert_eq!(report.outcome, StopOutcome::Drained);
    assert_eq!(report.state.tasks_abandoned, 3);
    assert!(report.state.is_accounted());
    assert!(report.state.started_at.is_none());

    assert_eq!(
        engine.stop(Duration::from_millis(10)).await.unwrap_err(),
        EngineError::NotRunning
    );
    assert_eq!(engine.start().await, Err(EngineError::ShuttingDown));
    assert_eq!(
        engine.submit("late.md", TaskKind::Parse, Priority::NORMAL),
        Err(EngineError::ShuttingDown)
    );
    assert_eq!(engine.status().queue_depth, 0);
}

#[tokio::test]
async fn consume_returns_when_shutdown_begins() {
    let engine = Arc::new(engine(
        EngineConfig::default(),
        FakeParser::new(),
        FakeStorage::new(),
    ));
    engine.start().await.unwrap();

    let (tx, rx) = tokio::sync::mpsc::channel::<ChangeEvent>(8);
    let consumer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.consume(rx).await })
    };
    tx.send(ChangeEvent::new("live.md", ChangeKind::Created))
        .await
        .unwrap();
    wait_for_state(&engine, WAIT, |state| state.chains_completed == 1)
        .await
        .expect("change processed");

    engine.stop(Duration::from_secs(1)).await.unwrap();
    let report = tokio::time::timeout(WAIT, consumer)
        .await
        .expect("consumer exited")
        .unwrap();
    assert_eq!(report.accepted, 1);
    drop(tx);
}
