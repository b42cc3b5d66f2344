use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use anyhow::Context;

use crate::collaborator::{
    HandlerTable, MetricsSink, Parser, Storage, TaskHandler, TracingMetricsSink,
};
use crate::config::EngineConfig;
use crate::task::TaskKind;

use super::supervisor::Orchestrator;

/// Builder for constructing an [`Orchestrator`] with explicit collaborators.
///
/// The builder validates the configuration and that some collaborator is
/// present before constructing the engine.
///
/// # Example
///
/// ```ignore
/// use docflow::*;
///
/// let engine = OrchestratorBuilder::new(EngineConfig::default())
///     .with_parser(parser)
///     .with_storage(storage)
///     .build()?;
/// ```
pub struct OrchestratorBuilder {
    config: EngineConfig,
    parser: Option<Arc<dyn Parser>>,
    parser_type: Option<&'static str>,
    storage: Option<Arc<dyn Storage>>,
    storage_type: Option<&'static str>,
    handlers: HandlerTable,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("OrchestratorBuilder");
        debug.field("config", &self.config);
        debug.field("parser_set", &self.parser.is_some());
        debug.field("storage_set", &self.storage.is_some());
        debug.field("handlers", &self.handlers);
        debug.field("sink_set", &self.sink.is_some());

        if let Some(parser_type) = self.parser_type {
            debug.field("parser_type", &parser_type);
        }
        if let Some(storage_type) = self.storage_type {
            debug.field("storage_type", &storage_type);
        }

        debug.finish()
    }
}

impl OrchestratorBuilder {
    /// Start a builder with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            parser: None,
            parser_type: None,
            storage: None,
            storage_type: None,
            handlers: HandlerTable::new(),
            sink: None,
        }
    }

    /// Set the parser used by parse and update tasks.
    pub fn with_parser<P: Parser + 'static>(mut self, parser: Arc<P>) -> Self {
        self.parser = Some(parser);
        self.parser_type = Some(type_name::<P>());
        self
    }

    /// Set the storage used by index and delete tasks.
    pub fn with_storage<S: Storage + 'static>(mut self, storage: Arc<S>) -> Self {
        self.storage = Some(storage);
        self.storage_type = Some(type_name::<S>());
        self
    }

    /// Override the handler for one task kind.
    pub fn with_handler(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Set the sink receiving one sample per task execution. Defaults to
    /// [`TracingMetricsSink`].
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the engine. It stays in `Starting` until
    /// [`Orchestrator::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, no collaborator was
    /// provided, or a parser was provided without anything to index its output.
    pub fn build(self) -> anyhow::Result<Orchestrator> {
        self.config
            .validate()
            .context("invalid engine configuration")?;

        if self.parser.is_none() && self.storage.is_none() && self.handlers.is_empty() {
            anyhow::bail!("parser or storage dependency missing");
        }

        let mut handlers = HandlerTable::from_collaborators(self.parser, self.storage);
        for kind in self.handlers.kinds().collect::<Vec<_>>() {
            if let Some(handler) = self.handlers.get(kind) {
                handlers.insert(kind, handler);
            }
        }

        if handlers.supports(TaskKind::Parse) && !handlers.supports(TaskKind::Index) {
            anyhow::bail!("storage dependency missing: parsed documents have nowhere to go");
        }

        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(TracingMetricsSink) as Arc<dyn MetricsSink>);

        tracing::debug!(
            kinds = ?handlers.kinds().collect::<Vec<_>>(),
            workers = self.config.workers,
            "docflow engine built"
        );
        Ok(Orchestrator::new(self.config, handlers, sink))
    }
}
