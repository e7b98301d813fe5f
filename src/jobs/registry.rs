//! Task handlers keyed by task kind

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::TaskOutcome;
use crate::aggregator::Aggregator;
use crate::models::{TaskArgs, TaskKind};
use crate::sources::RegisteredSource;

/// Executes one kind of task
///
/// Handlers report failures through [`TaskOutcome`]; they never retry or
/// touch job state themselves.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, args: &TaskArgs) -> TaskOutcome;
}

/// Maps task kinds to their handlers
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard handlers for every task kind, backed by `aggregator`
    pub fn with_aggregator(aggregator: Arc<Aggregator>) -> Self {
        let per_source: Arc<dyn TaskHandler> =
            Arc::new(SourceTaskHandler::new(aggregator.sources().clone()));
        let mut registry = Self::new();
        registry.register(TaskKind::FetchSource, Arc::clone(&per_source));
        registry.register(TaskKind::FetchCountry, per_source);
        registry.register(TaskKind::FetchAll, Arc::new(AggregateTaskHandler::new(aggregator)));
        registry
    }

    /// Register (or replace) the handler for `kind`
    pub fn register(&mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Runs single-source tasks directly against the source adapter
pub struct SourceTaskHandler {
    sources: BTreeMap<String, RegisteredSource>,
}

impl SourceTaskHandler {
    pub fn new(sources: BTreeMap<String, RegisteredSource>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl TaskHandler for SourceTaskHandler {
    async fn run(&self, args: &TaskArgs) -> TaskOutcome {
        let source_name = args.source();
        let Some(source) = self.sources.get(source_name) else {
            return TaskOutcome::permanent(format!("unknown source '{source_name}'"));
        };
        if !source.enabled {
            return TaskOutcome::permanent(format!("source '{source_name}' is disabled"));
        }

        let fetched = match args {
            TaskArgs::FetchCountry { country, .. } => source
                .adapter
                .fetch_country_advisory(country)
                .await
                .map(|_| 1),
            _ => source
                .adapter
                .fetch_all_advisories()
                .await
                .map(|advisories| advisories.len()),
        };

        match fetched {
            Ok(records) => {
                debug!(source = %source_name, records, "Source task fetched advisories");
                TaskOutcome::Success { records }
            }
            Err(e) => TaskOutcome::from_fetch_error(&e),
        }
    }
}

/// Runs fan-out tasks through the aggregator
///
/// A fan-out succeeds when at least one source answered; it fails (and is
/// retried) only when every source failed.
pub struct AggregateTaskHandler {
    aggregator: Arc<Aggregator>,
}

impl AggregateTaskHandler {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl TaskHandler for AggregateTaskHandler {
    async fn run(&self, args: &TaskArgs) -> TaskOutcome {
        let result = self.aggregator.fetch(args.country(), None).await;
        if result.success {
            info!(
                records = result.records.len(),
                sources = ?result.sources_used,
                failed = result.per_source_errors.len(),
                "Aggregated advisories"
            );
            return TaskOutcome::Success {
                records: result.records.len(),
            };
        }

        let reason = if result.per_source_errors.is_empty() {
            "no source returned data".to_string()
        } else {
            result
                .per_source_errors
                .iter()
                .map(|(source, error)| format!("{source}: {error}"))
                .collect::<Vec<_>>()
                .join("; ")
        };
        TaskOutcome::transient(reason)
    }
}
