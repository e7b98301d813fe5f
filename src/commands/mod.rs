pub mod fetch;
pub mod jobs;
pub mod ops;

// Re-export command functions for convenience
pub use fetch::fetch;
pub use jobs::{enqueue, worker, EnqueueParams, WorkerParams};
pub use ops::{dead_letter, health, metrics, rollup, DeadLetterAction};

use anyhow::{Context, Result};
use std::sync::Arc;

use wayfarer::aggregator::Aggregator;
use wayfarer::cache::{self, ResponseCache};
use wayfarer::config::Config;
use wayfarer::ratelimit::RateGovernor;
use wayfarer::sources::{build_sources, RegisteredSource};
use wayfarer::storage::{self, Persistence};

/// Components shared by every command
pub struct Runtime {
    pub config: Config,
    pub store: Arc<dyn Persistence>,
    pub cache: Arc<dyn ResponseCache>,
    pub aggregator: Arc<Aggregator>,
}

impl Runtime {
    pub async fn build(config: Config) -> Result<Self> {
        let store = storage::open(&config.database).with_context(|| {
            format!(
                "Failed to open database at {}",
                config.database.sqlite_path.display()
            )
        })?;
        let cache = cache::from_settings(&config.cache).await;
        tracing::debug!(backend = cache.backend(), "Response cache ready");

        let limits = config
            .sources
            .iter()
            .map(|(name, source)| (name.clone(), source.clone()))
            .collect();
        let governor = Arc::new(RateGovernor::new(Arc::clone(&store), limits));
        let sources = build_sources(&config, governor, Arc::clone(&cache))
            .context("Failed to build source clients")?;
        let aggregator = Arc::new(Aggregator::new(sources, &config.aggregator));

        Ok(Self {
            config,
            store,
            cache,
            aggregator,
        })
    }

    pub fn sources(&self) -> &std::collections::BTreeMap<String, RegisteredSource> {
        self.aggregator.sources()
    }
}
