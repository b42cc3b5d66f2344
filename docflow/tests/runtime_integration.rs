//! Runtime integration tests for the docflow engine.
//!
//! Tests chain advancement, dedup, retry behavior, priority handling and the
//! change-source feed against in-memory fakes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use docflow::*;
use docflow_testkit::{
    collect_chains, next_matching, numbered_paths, wait_for_state, wait_until, FakeFailure,
    FakeParser, FakeStorage, Op, RecordingMetrics, ScriptedChanges, Timeline,
};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    engine: Orchestrator,
    parser: FakeParser,
    storage: FakeStorage,
    metrics: RecordingMetrics,
    timeline: Timeline,
}

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        base_delay_ms: 20,
        max_delay_ms: 500,
        max_attempts,
        jitter_ratio: 0.1,
    }
}

fn default_config() -> EngineConfig {
    EngineConfig::default()
        .with_workers(4)
        .with_retry(fast_retry(3))
        .with_requeue_interval(Duration::from_millis(5))
}

fn harness(config: EngineConfig, parser: FakeParser, storage: FakeStorage) -> Harness {
    let timeline = Timeline::new();
    let parser = parser.with_timeline(timeline.clone());
    let storage = storage.with_timeline(timeline.clone());
    let metrics = RecordingMetrics::new();
    let engine = OrchestratorBuilder::new(config)
        .with_parser(Arc::new(parser.clone()))
        .with_storage(Arc::new(storage.clone()))
        .with_metrics_sink(Arc::new(metrics.clone()))
        .build()
        .expect("build engine");
    Harness {
        engine,
        parser,
        storage,
        metrics,
        timeline,
    }
}

async fn wait_idle(engine: &Orchestrator) -> EngineState {
    wait_for_state(engine, WAIT, |state| {
        state.tasks_total > 0 && state.in_flight() == 0 && state.queue_depth == 0
    })
    .await
    .expect("engine went idle")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_paths_four_workers_complete() {
    let h = harness(default_config(), FakeParser::new(), FakeStorage::new());
    h.engine.start().await.expect("start engine");

    for path in numbered_paths("docs", "md", 50) {
        h.engine
            .submit(path, TaskKind::Parse, Priority::NORMAL)
            .expect("submit");
    }

    let state = wait_for_state(&h.engine, WAIT, |state| state.tasks_completed == 100)
        .await
        .expect("all tasks completed");
    assert_eq!(state.tasks_failed, 0);
    assert_eq!(state.queue_depth, 0);
    assert_eq!(state.chains_completed, 50);
    assert_eq!(state.completed_by_kind.get(&TaskKind::Parse), Some(&50));
    assert_eq!(state.completed_by_kind.get(&TaskKind::Index), Some(&50));
    assert_eq!(state.extensions.get("md"), Some(&50));
    assert_eq!(h.storage.document_count(), 50);
    assert!(wait_until(WAIT, || h.metrics.count(SampleOutcome::Completed) == 100).await);
    h.timeline.assert_no_overlap();

    let report = h.engine.stop(Duration::from_secs(1)).await.expect("stop");
    assert!(report.state.is_accounted());
    assert!(report.abandoned.is_empty());
}

#[tokio::test]
async fn same_path_twice_before_dequeue_parses_once() {
    let h = harness(default_config(), FakeParser::new(), FakeStorage::new());

    let first = h
        .engine
        .submit("notes/a.md", TaskKind::Parse, Priority::LOW)
        .unwrap();
    let second = h
        .engine
        .submit("notes/a.md", TaskKind::Parse, Priority::URGENT)
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(h.engine.status().tasks_coalesced, 1);

    h.engine.start().await.unwrap();
    let state = wait_idle(&h.engine).await;
    assert_eq!(state.tasks_total, 2);
    assert_eq!(state.chains_completed, 1);
    h.parser.assert_call_count_eq(1);

    let parse = h
        .engine
        .history()
        .into_iter()
        .find(|record| record.kind == TaskKind::Parse)
        .expect("parse recorded");
    assert_eq!(parse.task_id, first);
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn index_never_observed_before_parse_completes() {
    let h = harness(
        default_config(),
        FakeParser::new().with_delay(Duration::from_millis(30)),
        FakeStorage::new(),
    );
    let mut events = h.engine.subscribe();
    h.engine.start().await.unwrap();

    let paths = numbered_paths("slow", "txt", 8);
    for path in &paths {
        h.engine
            .submit(path.clone(), TaskKind::Parse, Priority::NORMAL)
            .unwrap();
    }

    let seen = collect_chains(&mut events, paths.len(), WAIT).await;
    for path in &paths {
        assert_eq!(
            h.timeline.ops_for(path),
            vec![Op::ParseStarted, Op::ParseFinished, Op::Stored],
            "unexpected collaborator order for {}",
            path.display()
        );
    }

    // The index task of a chain only appears once its parse has completed.
    let mut parse_done: HashMap<ChainId, usize> = HashMap::new();
    for (position, event) in seen.iter().enumerate() {
        match &event.payload {
            TaskEventPayload::Completed {
                kind: TaskKind::Parse,
                ..
            } => {
                parse_done.insert(event.meta.chain_id, position);
            }
            TaskEventPayload::Enqueued {
                kind: TaskKind::Index,
                ..
            } => {
                let done = parse_done
                    .get(&event.meta.chain_id)
                    .expect("index enqueued after its parse completed");
                assert!(*done < position);
            }
            _ => {}
        }
    }

    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn always_failing_parse_runs_three_times_then_fails() {
    let h = harness(default_config(), FakeParser::new(), FakeStorage::new());
    h.parser.fail_always("broken.pdf", FakeFailure::transient());
    let mut events = h.engine.subscribe();
    h.engine.start().await.unwrap();

    let id = h
        .engine
        .submit("broken.pdf", TaskKind::Parse, Priority::NORMAL)
        .unwrap();

    let mut delays = Vec::new();
    let failed = timeout(WAIT, async {
        loop {
            let event = next_matching(&mut events, WAIT, |event| event.task_id() == id)
                .await
                .expect("event stream open");
            match event.payload {
                TaskEventPayload::RetryScheduled { delay_ms, .. } => delays.push(delay_ms),
                TaskEventPayload::Failed {
                    attempt, reason, ..
                } => return (attempt, reason),
                _ => {}
            }
        }
    })
    .await
    .expect("task failed in time");

    assert_eq!(failed, (3, GiveUpReason::Exhausted));
    assert_eq!(delays.len(), 2);
    assert!(delays[0] <= delays[1], "delays decreased: {delays:?}");

    let calls = h.parser.calls_for("broken.pdf");
    assert_eq!(calls.len(), 3);
    for (gap, delay_ms) in calls.windows(2).map(|w| w[1] - w[0]).zip(&delays) {
        assert!(gap >= Duration::from_millis(*delay_ms));
    }

    let state = wait_idle(&h.engine).await;
    assert_eq!(state.tasks_failed, 1);
    assert_eq!(state.tasks_retrying, 0);
    assert_eq!(state.chains_failed, 1);
    assert!(wait_until(WAIT, || h.metrics.count(SampleOutcome::Failed) == 1).await);
    assert_eq!(h.metrics.count(SampleOutcome::Retrying), 2);
    assert!(h.storage.stores().is_empty());

    let failure = h
        .engine
        .failures()
        .remove(&PathBuf::from("broken.pdf"))
        .expect("failure recorded");
    assert_eq!(failure.task_id, id);
    assert_eq!(failure.attempt, 3);
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn transient_failure_recovers_and_clears_failure_record() {
    let h = harness(default_config(), FakeParser::new(), FakeStorage::new());
    h.parser.fail_times("flaky.md", 1, FakeFailure::transient());
    h.engine.start().await.unwrap();

    h.engine
        .submit("flaky.md", TaskKind::Parse, Priority::NORMAL)
        .unwrap();
    let state = wait_idle(&h.engine).await;
    assert_eq!(state.tasks_completed, 2);
    assert_eq!(state.tasks_failed, 0);
    assert_eq!(h.parser.calls_for("flaky.md").len(), 2);
    assert!(h.storage.document("flaky.md").is_some());
    assert!(h.engine.failures().is_empty());
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn permanent_index_failure_halts_chain() {
    let h = harness(default_config(), FakeParser::new(), FakeStorage::new());
    h.storage.fail_always("readonly.md", FakeFailure::permanent());
    h.engine.start().await.unwrap();

    h.engine
        .submit("readonly.md", TaskKind::Parse, Priority::NORMAL)
        .unwrap();
    let state = wait_idle(&h.engine).await;
    assert_eq!(state.tasks_completed, 1);
    assert_eq!(state.tasks_failed, 1);
    assert_eq!(state.chains_failed, 1);

    let failure = h.engine.failures().remove(&PathBuf::from("readonly.md")).unwrap();
    assert_eq!(failure.kind, TaskKind::Index);
    assert_eq!(failure.attempt, 1);
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn panicking_parser_fails_without_retry() {
    let h = harness(default_config(), FakeParser::new(), FakeStorage::new());
    h.parser
        .fail_always("cursed.bin", FakeFailure::Panic("parser exploded".into()));
    let mut events = h.engine.subscribe();
    h.engine.start().await.unwrap();

    h.engine
        .submit("cursed.bin", TaskKind::Parse, Priority::NORMAL)
        .unwrap();
    let failed = next_matching(&mut events, WAIT, |event| {
        matches!(event.payload, TaskEventPayload::Failed { .. })
    })
    .await
    .expect("failure event");
    match failed.payload {
        TaskEventPayload::Failed { reason, error, .. } => {
            assert_eq!(reason, GiveUpReason::NonRetryable);
            assert!(error.contains("parser exploded"));
        }
        other => panic!("unexpected payload {other:?}"),
    }
    h.parser.assert_call_count_eq(1);

    // The worker survived the panic.
    h.engine
        .submit("fine.md", TaskKind::Parse, Priority::NORMAL)
        .unwrap();
    wait_for_state(&h.engine, WAIT, |state| state.chains_completed == 1)
        .await
        .expect("later chain completed");
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn timed_out_parse_is_retried_until_exhausted() {
    let config = EngineConfig::default()
        .with_workers(1)
        .with_task_timeout(Duration::from_millis(20))
        .with_retry(fast_retry(2));
    let h = harness(
        config,
        FakeParser::new().with_delay(Duration::from_secs(5)),
        FakeStorage::new(),
    );
    h.engine.start().await.unwrap();

    h.engine
        .submit("huge.pdf", TaskKind::Parse, Priority::NORMAL)
        .unwrap();
    let state = wait_idle(&h.engine).await;
    assert_eq!(state.tasks_failed, 1);
    assert_eq!(h.parser.calls_for("huge.pdf").len(), 2);
    let failure = h.engine.failures().remove(&PathBuf::from("huge.pdf")).unwrap();
    assert!(failure.error.contains("timed out"));
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn submission_behind_running_chain_runs_after_it() {
    let h = harness(
        default_config(),
        FakeParser::new().with_delay(Duration::from_millis(50)),
        FakeStorage::new(),
    );
    let mut events = h.engine.subscribe();
    h.engine.start().await.unwrap();

    let parse = h
        .engine
        .submit("moving.md", TaskKind::Parse, Priority::NORMAL)
        .unwrap();
    next_matching(&mut events, WAIT, |event| {
        event.task_id() == parse && matches!(event.payload, TaskEventPayload::Started { .. })
    })
    .await
    .expect("parse started");

    let delete = h
        .engine
        .submit("moving.md", TaskKind::Delete, Priority::URGENT)
        .unwrap();
    let again = h
        .engine
        .submit("moving.md", TaskKind::Delete, Priority::NORMAL)
        .unwrap();
    assert_eq!(delete, again);

    let deferred = next_matching(&mut events, WAIT, |event| event.task_id() == delete)
        .await
        .expect("deferred event");
    assert!(matches!(
        deferred.payload,
        TaskEventPayload::Deferred { behind, .. } if behind == parse
    ));

    let state = wait_for_state(&h.engine, WAIT, |state| state.chains_completed == 2)
        .await
        .expect("both chains completed");
    assert_eq!(state.tasks_total, 3);
    assert_eq!(state.tasks_coalesced, 1);
    assert_eq!(
        h.timeline.ops_for("moving.md"),
        vec![Op::ParseStarted, Op::ParseFinished, Op::Stored, Op::Deleted]
    );
    assert!(h.storage.document("moving.md").is_none());
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn recreate_after_remove_is_not_folded_into_first_parse() {
    let h = harness(
        default_config().with_workers(1),
        FakeParser::new(),
        FakeStorage::new(),
    );

    let created = h
        .engine
        .submit("a.md", TaskKind::Parse, Priority::NORMAL)
        .unwrap();
    let removed = h
        .engine
        .submit("a.md", TaskKind::Delete, Priority::NORMAL)
        .unwrap();
    let recreated = h
        .engine
        .submit("a.md", TaskKind::Parse, Priority::NORMAL)
        .unwrap();
    assert_ne!(recreated, created);
    assert_ne!(recreated, removed);
    // A further edit folds into the parked re-create, not the first parse.
    let edited = h
        .engine
        .submit("a.md", TaskKind::Parse, Priority::HIGH)
        .unwrap();
    assert_eq!(edited, recreated);
    assert_eq!(h.engine.status().tasks_coalesced, 1);

    h.engine.start().await.unwrap();
    let state = wait_for_state(&h.engine, WAIT, |state| state.chains_completed == 3)
        .await
        .expect("three chains completed");
    assert_eq!(state.tasks_total, 5);
    assert_eq!(state.tasks_failed, 0);
    assert_eq!(
        h.timeline.ops_for("a.md"),
        vec![
            Op::ParseStarted,
            Op::ParseFinished,
            Op::Stored,
            Op::Deleted,
            Op::ParseStarted,
            Op::ParseFinished,
            Op::Stored,
        ]
    );
    assert!(h.storage.document("a.md").is_some());
    h.parser.assert_call_count_eq(2);
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_task_per_subject_in_flight() {
    let h = harness(
        default_config(),
        FakeParser::new().with_delay(Duration::from_millis(3)),
        FakeStorage::new().with_delay(Duration::from_millis(2)),
    );
    h.engine.start().await.unwrap();

    let paths = numbered_paths("hot", "md", 5);
    for round in 0..20 {
        for path in &paths {
            let kind = match round % 3 {
                0 => TaskKind::Parse,
                1 => TaskKind::Update,
                _ => TaskKind::Delete,
            };
            h.engine.submit(path.clone(), kind, Priority::NORMAL).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let state = wait_idle(&h.engine).await;
    assert_eq!(state.tasks_failed, 0);
    h.timeline.assert_no_overlap();
    let report = h.engine.stop(Duration::from_secs(1)).await.unwrap();
    assert!(report.state.is_accounted());
}

#[tokio::test]
async fn urgent_work_runs_before_queued_backlog() {
    let config = default_config().with_workers(1);
    let h = harness(config, FakeParser::new(), FakeStorage::new());

    for path in numbered_paths("backlog", "md", 5) {
        h.engine.submit(path, TaskKind::Delete, Priority::LOW).unwrap();
    }
    h.engine
        .submit("urgent.md", TaskKind::Delete, Priority::URGENT)
        .unwrap();
    h.engine.start().await.unwrap();

    wait_idle(&h.engine).await;
    let deletes = h.storage.deletes();
    assert_eq!(deletes.len(), 6);
    assert_eq!(deletes[0], PathBuf::from("urgent.md"));
    assert_eq!(deletes[1], PathBuf::from("backlog/0.md"));
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn submit_past_capacity_returns_queue_full() {
    let config = default_config().with_queue_capacity(2);
    let h = harness(config, FakeParser::new(), FakeStorage::new());

    h.engine.submit("a.md", TaskKind::Parse, Priority::NORMAL).unwrap();
    h.engine.submit("b.md", TaskKind::Parse, Priority::NORMAL).unwrap();
    assert_eq!(
        h.engine.submit("c.md", TaskKind::Parse, Priority::NORMAL),
        Err(EngineError::QueueFull { capacity: 2 })
    );

    let state = h.engine.status();
    assert_eq!(state.tasks_total, 2);
    assert_eq!(state.queue_depth, 2);

    // Coalescing into a queued task needs no capacity.
    assert!(h.engine.submit("a.md", TaskKind::Parse, Priority::HIGH).is_ok());
}

#[tokio::test]
async fn consume_feeds_changes_with_backpressure() {
    let config = default_config().with_workers(1).with_queue_capacity(1);
    let h = harness(config, FakeParser::new(), FakeStorage::new());
    h.engine.start().await.unwrap();

    let paths = numbered_paths("feed", "txt", 6);
    let mut changes: Vec<ChangeEvent> = paths
        .iter()
        .map(|path| ChangeEvent::new(path.clone(), ChangeKind::Created))
        .collect();
    changes.push(ChangeEvent::new("", ChangeKind::Created));
    changes.push(
        ChangeEvent::new(paths[0].clone(), ChangeKind::Removed).with_priority(Priority::HIGH),
    );

    let report = timeout(WAIT, h.engine.consume(ScriptedChanges::new(changes)))
        .await
        .expect("consume finished");
    assert_eq!(report.accepted, 7);
    assert_eq!(report.rejected, 1);

    let state = wait_for_state(&h.engine, WAIT, |state| state.chains_completed == 7)
        .await
        .expect("chains completed");
    assert_eq!(state.tasks_failed, 0);
    assert_eq!(h.storage.document_count(), 5);
    assert_eq!(h.storage.deletes(), vec![paths[0].clone()]);
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn consecutive_failures_degrade_until_success() {
    let config = default_config()
        .with_workers(1)
        .with_degraded_after_failures(2);
    let h = harness(config, FakeParser::new(), FakeStorage::new());
    h.parser.fail_always("bad-1.md", FakeFailure::permanent());
    h.parser.fail_always("bad-2.md", FakeFailure::permanent());
    h.engine.start().await.unwrap();

    h.engine.submit("bad-1.md", TaskKind::Parse, Priority::NORMAL).unwrap();
    h.engine.submit("bad-2.md", TaskKind::Parse, Priority::NORMAL).unwrap();
    let state = wait_for_state(&h.engine, WAIT, |state| state.chains_failed == 2)
        .await
        .expect("both chains failed");
    assert_eq!(state.status, EngineStatus::Degraded);
    assert!(state.status.accepts_work());

    h.engine.submit("good.md", TaskKind::Parse, Priority::NORMAL).unwrap();
    let state = wait_for_state(&h.engine, WAIT, |state| state.chains_completed == 1)
        .await
        .expect("good chain completed");
    assert_eq!(state.status, EngineStatus::Running);
    assert_eq!(h.engine.failures().len(), 2);
    h.engine.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn failing_metrics_sink_is_ignored() {
    let metrics = RecordingMetrics::failing();
    let storage = FakeStorage::new();
    let engine = OrchestratorBuilder::new(default_config())
        .with_storage(Arc::new(storage.clone()))
        .with_metrics_sink(Arc::new(metrics.clone()))
        .build()
        .unwrap();
    engine.start().await.unwrap();

    engine.submit("x.md", TaskKind::Delete, Priority::NORMAL).unwrap();
    engine.submit("y.md", TaskKind::Delete, Priority::NORMAL).unwrap();
    let state = wait_idle(&engine).await;
    assert_eq!(state.tasks_completed, 2);
    assert!(wait_until(WAIT, || metrics.samples().len() == 2).await);
    assert_eq!(
        engine.submit("z.md", TaskKind::Parse, Priority::NORMAL),
        Err(EngineError::UnsupportedKind(TaskKind::Parse))
    );
    engine.stop(Duration::from_secs(1)).await.unwrap();
}
