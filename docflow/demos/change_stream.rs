//! Change-stream example: a watcher-like producer feeding the engine.
//!
//! A producer task pushes create/modify/remove events into a bounded tokio
//! channel; the engine consumes the channel as its change source, and a
//! subscriber prints the task lifecycle events as they arrive.

use std::sync::Arc;
use std::time::Duration;

use docflow::*;
use docflow_testkit::{wait_for_state, FakeParser, FakeStorage};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

async fn print_events(mut rx: broadcast::Receiver<TaskEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let path = event.meta.subject.display();
                match event.payload {
                    TaskEventPayload::Started { kind, attempt, worker } => {
                        println!("   [worker {worker}] {kind} {path} (attempt {attempt})");
                    }
                    TaskEventPayload::Coalesced { kind, .. } => {
                        println!("   coalesced {kind} {path}");
                    }
                    TaskEventPayload::Deferred { kind, .. } => {
                        println!("   deferred {kind} {path} behind running chain");
                    }
                    TaskEventPayload::ChainCompleted { succeeded } => {
                        println!("   chain for {path} done (succeeded: {succeeded})");
                    }
                    TaskEventPayload::Abandoned { kind, reason } => {
                        println!("   abandoned {kind} {path}: {reason:?}");
                    }
                    _ => {}
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                println!("   (skipped {skipped} events)");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    println!("=== Docflow Change Stream Example ===\n");

    let storage = FakeStorage::new();
    let engine = Arc::new(
        OrchestratorBuilder::new(
            EngineConfig::default()
                .with_workers(3)
                .with_queue_capacity(4),
        )
        .with_parser(Arc::new(
            FakeParser::new().with_delay(Duration::from_millis(30)),
        ))
        .with_storage(Arc::new(storage.clone()))
        .build()?,
    );

    let printer = tokio::spawn(print_events(engine.subscribe()));
    engine.start().await?;

    let (tx, rx) = mpsc::channel::<ChangeEvent>(16);
    let consumer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.consume(rx).await })
    };

    println!("1. Producing changes...");
    for i in 0..6 {
        tx.send(ChangeEvent::new(format!("src/file_{i}.rs"), ChangeKind::Created))
            .await?;
    }
    // Rapid edits of the same file while its first chain is still running.
    for _ in 0..3 {
        tx.send(ChangeEvent::new("src/file_0.rs", ChangeKind::Modified))
            .await?;
    }
    tx.send(ChangeEvent::new("src/file_5.rs", ChangeKind::Removed).with_priority(Priority::URGENT))
        .await?;
    drop(tx);

    let report = consumer.await?;
    println!(
        "\n2. Change stream ended: accepted={} rejected={}",
        report.accepted, report.rejected
    );

    wait_for_state(&engine, Duration::from_secs(10), |state| state.in_flight() == 0)
        .await
        .ok_or_else(|| anyhow::anyhow!("engine did not go idle"))?;

    let report = engine.stop(Duration::from_secs(2)).await?;
    println!("\n3. Shutdown:");
    println!(
        "   total={} completed={} coalesced={} documents={}",
        report.state.tasks_total,
        report.state.tasks_completed,
        report.state.tasks_coalesced,
        storage.document_count()
    );

    drop(engine);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    Ok(())
}
