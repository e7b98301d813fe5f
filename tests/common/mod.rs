//! Common test utilities

use std::collections::BTreeMap;
use std::sync::Arc;

use wayfarer::aggregator::Aggregator;
use wayfarer::cache::{InMemoryCache, ResponseCache};
use wayfarer::config::{Config, HttpConfig, SourceConfig};
use wayfarer::http::CachedHttpClient;
use wayfarer::ratelimit::RateGovernor;
use wayfarer::sources::build_sources;
use wayfarer::storage::{Persistence, SqliteStore};

/// Source limits loose enough that the governor never makes a test wait
pub fn source_config(base_url: &str) -> SourceConfig {
    SourceConfig {
        base_url: base_url.to_string(),
        rate_limit_per_hour: 10_000,
        burst_limit: 1_000,
        min_delay_seconds: 0.0,
        circuit_failure_threshold: 50,
        ..Default::default()
    }
}

/// HTTP settings with millisecond backoffs
pub fn fast_http(max_attempts: u32) -> HttpConfig {
    HttpConfig {
        request_timeout_secs: 5,
        max_attempts,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        requests_per_second: 1_000,
        ..Default::default()
    }
}

pub fn memory_store() -> Arc<dyn Persistence> {
    Arc::new(SqliteStore::in_memory().expect("in-memory store"))
}

/// Governor over the given sources backed by `store`
pub fn governor(store: &Arc<dyn Persistence>, sources: &[(&str, &SourceConfig)]) -> Arc<RateGovernor> {
    let limits = sources
        .iter()
        .map(|(name, config)| (name.to_string(), (*config).clone()))
        .collect();
    Arc::new(RateGovernor::new(Arc::clone(store), limits))
}

/// A client for one source with its own store and cache
#[allow(dead_code)]
pub fn client(name: &str, source: &SourceConfig, http: &HttpConfig) -> CachedHttpClient {
    let store = memory_store();
    let cache: Arc<dyn ResponseCache> = Arc::new(InMemoryCache::new());
    CachedHttpClient::new(name, source, http, governor(&store, &[(name, source)]), cache)
        .expect("client")
}

/// Config with the given sources and fast HTTP retries
#[allow(dead_code)]
pub fn config_with(sources: &[(&str, SourceConfig)], http_attempts: u32) -> Config {
    Config {
        http: fast_http(http_attempts),
        sources: sources
            .iter()
            .map(|(name, config)| (name.to_string(), config.clone()))
            .collect::<BTreeMap<_, _>>(),
        ..Default::default()
    }
}

/// Aggregator over every source in `config`, sharing `store`
#[allow(dead_code)]
pub fn aggregator(config: &Config, store: &Arc<dyn Persistence>) -> Arc<Aggregator> {
    let limits = config
        .sources
        .iter()
        .map(|(name, source)| (name.clone(), source.clone()))
        .collect();
    let governor = Arc::new(RateGovernor::new(Arc::clone(store), limits));
    let cache: Arc<dyn ResponseCache> = Arc::new(InMemoryCache::new());
    let sources = build_sources(config, governor, cache).expect("sources");
    Arc::new(Aggregator::new(sources, &config.aggregator))
}

/// JSON body of one advisory
#[allow(dead_code)]
pub fn advisory_json(country: &str, risk: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "country": country,
        "risk": risk,
        "summary": format!("Advisory for {country}"),
    })
}
