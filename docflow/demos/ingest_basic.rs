//! Basic ingestion example with in-memory collaborators.
//!
//! This example demonstrates:
//! - Wiring a parser and storage into an orchestrator
//! - Priority submissions and dedup of repeated submissions
//! - Retry of a transient parse failure
//! - Graceful shutdown and the final accounting
//!
//! Run with `RUST_LOG=docflow=debug cargo run --example ingest_basic` for
//! the engine's own logs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docflow::*;
use docflow_testkit::{wait_for_state, FakeStorage};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Parser over a fixed set of in-memory files. The first parse of a file
/// whose name contains "flaky" fails transiently.
struct MemoryParser {
    files: HashMap<&'static str, &'static str>,
    flaky_seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Parser for MemoryParser {
    async fn parse(
        &self,
        path: &Path,
        cancel: &ShutdownToken,
    ) -> Result<ParsedDocument, CollaboratorError> {
        let name = path.to_string_lossy().into_owned();
        let Some(content) = self.files.get(name.as_str()) else {
            return Err(CollaboratorError::permanent(format!("{name}: no such file")));
        };

        if name.contains("flaky") {
            let mut seen = self.flaky_seen.lock();
            if !seen.contains(&name) {
                seen.push(name.clone());
                return Err(CollaboratorError::transient("device busy"));
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            _ = cancel.cancelled() => return Err(CollaboratorError::Cancelled),
        }

        let content_type = match path.extension().and_then(|ext| ext.to_str()) {
            Some("md") => "text/markdown",
            Some("json") => "application/json",
            _ => "text/plain",
        };
        Ok(ParsedDocument::new(path, *content, content_type)
            .with_metadata("words", content.split_whitespace().count().to_string()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    println!("=== Docflow Ingest Basic Example ===\n");

    let parser = Arc::new(MemoryParser {
        files: HashMap::from([
            ("notes/today.md", "# Today\nship the release"),
            ("notes/flaky.txt", "sometimes the disk is busy"),
            ("config/app.json", "{\"name\": \"docflow\"}"),
            ("notes/readme.md", "read me first"),
        ]),
        flaky_seen: Mutex::new(Vec::new()),
    });
    let storage = FakeStorage::new();

    let config = EngineConfig::default()
        .with_workers(2)
        .with_retry(RetryConfig {
            base_delay_ms: 100,
            ..RetryConfig::default()
        });
    let engine = OrchestratorBuilder::new(config)
        .with_parser(parser)
        .with_storage(Arc::new(storage.clone()))
        .build()?;

    println!("1. Submitting work...");
    let submissions = [
        ("notes/today.md", Priority::NORMAL),
        ("notes/flaky.txt", Priority::LOW),
        ("config/app.json", Priority::HIGH),
        ("notes/readme.md", Priority::URGENT),
        ("notes/missing.md", Priority::NORMAL),
        // Same path again before it ran: coalesced into the first submission.
        ("notes/today.md", Priority::HIGH),
    ];
    for (path, priority) in submissions {
        let id = engine.submit(path, TaskKind::Parse, priority)?;
        println!("   {path} (priority {priority}) -> task {id}");
    }

    println!("\n2. Starting workers...");
    engine.start().await?;

    let state = wait_for_state(&engine, Duration::from_secs(10), |state| {
        state.chains_completed + state.chains_failed == 5
    })
    .await
    .ok_or_else(|| anyhow::anyhow!("chains did not finish in time"))?;
    println!(
        "   chains completed: {}, failed: {}",
        state.chains_completed, state.chains_failed
    );

    println!("\n3. Stored documents:");
    for path in storage.stores() {
        if let Some(document) = storage.document(&path) {
            println!(
                "   {} [{}] words={}",
                path.display(),
                document.content_type,
                document.metadata.get("words").map(String::as_str).unwrap_or("?")
            );
        }
    }

    println!("\n4. Failures:");
    for (path, failure) in engine.failures() {
        println!("   {} ({}): {}", path.display(), failure.kind, failure.error);
    }

    println!("\n5. Stopping...");
    let report = engine.stop(Duration::from_secs(5)).await?;
    let state = &report.state;
    println!("   status: {}", state.status);
    println!(
        "   total={} completed={} failed={} abandoned={} coalesced={}",
        state.tasks_total,
        state.tasks_completed,
        state.tasks_failed,
        state.tasks_abandoned,
        state.tasks_coalesced
    );
    println!("   success rate: {:.1}%", state.success_rate());
    println!("   by extension: {:?}", state.extensions);
    println!("   accounted: {}", state.is_accounted());

    Ok(())
}
