//! Configuration management for wayfarer
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. Per-source governance settings (quota, burst,
//! delays, cache TTL, retries, breaker thresholds) live under `[sources.<name>]`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Outbound HTTP settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Job execution settings
    #[serde(default)]
    pub jobs: JobConfig,

    /// Dead-letter recovery settings
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Aggregator settings
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// External sources keyed by name
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

/// Outbound HTTP settings shared by all source clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// User agent string
    pub user_agent: String,

    /// Attempts per request for transient failures (including the first)
    pub max_attempts: u32,

    /// Base backoff delay between request attempts in milliseconds
    pub retry_base_delay_ms: u64,

    /// Cap on the backoff delay in milliseconds
    pub retry_max_delay_ms: u64,

    /// Local pacing ceiling (requests per second per client)
    pub requests_per_second: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            user_agent: format!("wayfarer/{}", env!("CARGO_PKG_VERSION")),
            max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30_000,
            requests_per_second: 5,
        }
    }
}

/// Job execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Number of concurrent workers
    pub workers: usize,

    /// Default maximum attempts when a source has no override
    pub default_max_retries: u32,

    /// Base delay for task-level retries in seconds
    pub retry_base_delay_secs: u64,

    /// Cap on task-level retry delays in seconds
    pub retry_max_delay_secs: u64,

    /// Completed jobs older than this are purged (hours)
    pub retention_hours: u64,

    /// STARTED jobs older than this at recovery are treated as lost (seconds)
    pub orphan_timeout_secs: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_max_retries: 3,
            retry_base_delay_secs: 60,
            retry_max_delay_secs: 3600,
            retention_hours: 24 * 7,
            orphan_timeout_secs: 30 * 60,
        }
    }
}

/// Dead-letter recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Absolute ceiling on total attempts before manual review
    pub max_total_attempts: u32,

    /// Records examined per batch
    pub batch_size: usize,

    /// Seconds between batches
    pub interval_secs: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_total_attempts: 5,
            batch_size: 50,
            interval_secs: 30 * 60,
        }
    }
}

/// Aggregator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Maximum number of sources queried at once
    pub max_concurrent_sources: usize,

    /// Optional overall deadline for a fetch in seconds
    pub deadline_secs: Option<u64>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sources: 8,
            deadline_secs: None,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/wayfarer.db"),
        }
    }
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Redis URL; the in-process cache is used when absent
    pub redis_url: Option<String>,

    /// Default TTL for cached responses in seconds
    pub default_ttl_secs: u64,

    /// Key prefix for namespacing
    pub key_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            default_ttl_secs: 3600,
            key_prefix: "wayfarer".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

/// Daytime window during which requests to a source are slowed further
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RespectfulHours {
    /// First hour of the window (0-23, source-local time)
    pub start_hour: u32,

    /// Hour at which the window ends (exclusive, 0-23)
    pub end_hour: u32,

    /// Offset of the source's local time from UTC in hours
    #[serde(default)]
    pub utc_offset_hours: i32,

    /// Multiplier applied to the minimum inter-request delay
    pub multiplier: f64,
}

impl RespectfulHours {
    /// Whether `hour` (source-local) falls inside the window
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Per-source governance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base URL of the source's advisory feed
    pub base_url: String,

    /// Optional bearer token
    pub api_key: Option<String>,

    /// Whether the aggregator should query this source
    pub enabled: bool,

    /// Ranking priority (higher first)
    pub priority: u32,

    /// Durable hourly request quota
    pub rate_limit_per_hour: u32,

    /// In-process ceiling over a rolling 60 seconds
    pub burst_limit: u32,

    /// Minimum delay between consecutive requests in seconds
    pub min_delay_seconds: f64,

    /// Optional courtesy throttle window
    pub respectful_hours: Option<RespectfulHours>,

    /// TTL for cached responses in seconds
    #[serde(rename = "cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Maximum job attempts for work against this source
    pub max_retries: u32,

    /// Consecutive failures before the breaker opens
    pub circuit_failure_threshold: u32,

    /// Seconds the breaker stays open before a trial call
    pub circuit_recovery_timeout_seconds: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            enabled: true,
            priority: 1,
            rate_limit_per_hour: 60,
            burst_limit: 10,
            min_delay_seconds: 1.0,
            respectful_hours: None,
            cache_ttl_secs: 3600,
            max_retries: 3,
            circuit_failure_threshold: 5,
            circuit_recovery_timeout_seconds: 60,
        }
    }
}

impl SourceConfig {
    /// Minimum delay as Duration
    pub fn min_delay(&self) -> Duration {
        Duration::from_secs_f64(self.min_delay_seconds.max(0.0))
    }

    /// Cache TTL as Duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Breaker recovery timeout as Duration
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_recovery_timeout_seconds)
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Sources cannot be described through the environment; use
    /// [`Config::from_file`] for those.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<u64>("WAYFARER_REQUEST_TIMEOUT") {
            config.http.request_timeout_secs = v;
        }
        if let Ok(v) = std::env::var("WAYFARER_USER_AGENT") {
            config.http.user_agent = v;
        }
        if let Some(v) = env_parse::<usize>("WAYFARER_WORKERS") {
            config.jobs.workers = v;
        }
        if let Some(v) = env_parse::<u32>("WAYFARER_MAX_RETRIES") {
            config.jobs.default_max_retries = v;
        }
        if let Some(v) = env_parse::<u32>("WAYFARER_DEAD_LETTER_CEILING") {
            config.dead_letter.max_total_attempts = v;
        }
        if let Ok(v) = std::env::var("WAYFARER_SQLITE_PATH") {
            config.database.sqlite_path = v.into();
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            config.cache.redis_url = Some(v);
        }
        if let Ok(v) = std::env::var("WAYFARER_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("WAYFARER_LOG_FORMAT") {
            config.logging.format = v;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.jobs.workers == 0 {
            anyhow::bail!("jobs.workers must be greater than 0");
        }

        if self.http.max_attempts == 0 {
            anyhow::bail!("http.max_attempts must be greater than 0");
        }

        if self.aggregator.max_concurrent_sources == 0 {
            anyhow::bail!("aggregator.max_concurrent_sources must be greater than 0");
        }

        for (name, source) in &self.sources {
            if source.base_url.is_empty() {
                anyhow::bail!("source '{name}': base_url is required");
            }
            url::Url::parse(&source.base_url)
                .with_context(|| format!("source '{name}': invalid base_url"))?;
            if source.rate_limit_per_hour == 0 {
                anyhow::bail!("source '{name}': rate_limit_per_hour must be greater than 0");
            }
            if source.burst_limit == 0 {
                anyhow::bail!("source '{name}': burst_limit must be greater than 0");
            }
            if source.max_retries == 0 {
                anyhow::bail!("source '{name}': max_retries must be greater than 0");
            }
            if source.circuit_failure_threshold == 0 {
                anyhow::bail!("source '{name}': circuit_failure_threshold must be greater than 0");
            }
            if let Some(hours) = &source.respectful_hours {
                if hours.start_hour > 23 || hours.end_hour > 23 {
                    anyhow::bail!("source '{name}': respectful hours must be within 0-23");
                }
                if hours.multiplier < 1.0 {
                    anyhow::bail!("source '{name}': respectful multiplier must be >= 1.0");
                }
            }
        }

        Ok(())
    }

    /// Get request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http.request_timeout_secs)
    }

    /// Settings for a named source
    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.get(name)
    }

    /// Names of enabled sources
    pub fn enabled_sources(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            jobs: JobConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            aggregator: AggregatorConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheSettings::default(),
            logging: LoggingConfig::default(),
            sources: BTreeMap::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}
