//! wayfarer - Resilient travel-advisory ingestion
//!
//! Pulls advisories from many unreliable, rate-limited sources without
//! overloading them and without ever silently losing a unit of work.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and per-source settings
//! - [`ratelimit`] - Hourly quota, burst and pacing governor per source
//! - [`breaker`] - Per-source circuit breaker
//! - [`cache`] - Response cache (in-memory or Redis)
//! - [`http`] - Cached, governed, breaker-protected HTTP client
//! - [`sources`] - Source adapters and the JSON feed adapter
//! - [`aggregator`] - Concurrent multi-source fetch and risk normalization
//! - [`jobs`] - Job lifecycle, scheduler, workers and dead-letter recovery
//! - [`storage`] - SQLite persistence of jobs, dead letters, rate windows
//! - [`metrics`] - Prometheus runtime metrics and job rollups
//! - [`health`] - Health snapshot and operator alerts
//! - [`models`] - Core persisted data structures
//! - [`utils`] - Error taxonomy, retry helpers and common utilities
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wayfarer::aggregator::Aggregator;
//! use wayfarer::config::Config;
//! use wayfarer::ratelimit::RateGovernor;
//! use wayfarer::sources::build_sources;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = wayfarer::storage::open(&config.database)?;
//!     let governor = Arc::new(RateGovernor::new(store, config.sources.clone().into_iter().collect()));
//!     let cache = wayfarer::cache::from_settings(&config.cache).await;
//!     let sources = build_sources(&config, governor, cache)?;
//!     let aggregator = Aggregator::new(sources, &config.aggregator);
//!     let result = aggregator.fetch(Some("France"), None).await;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod health;
pub mod http;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod ratelimit;
pub mod sources;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::aggregator::{AggregatedResult, Aggregator, RiskLevel};
    pub use crate::breaker::{BreakerState, CircuitBreaker};
    pub use crate::config::Config;
    pub use crate::http::{CachedHttpClient, RequestResult};
    pub use crate::jobs::{DeadLetterManager, Scheduler, TaskRegistry, Worker};
    pub use crate::models::{DeadLetterRecord, JobRecord, JobStatus, Priority, TaskArgs};
    pub use crate::ratelimit::RateGovernor;
    pub use crate::sources::{RawAdvisory, SourceAdapter};
    pub use crate::storage::{Persistence, SqliteStore};
}

// Direct re-exports for convenience
pub use models::{JobRecord, JobStatus, TaskArgs};
