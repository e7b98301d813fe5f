//! Concurrent multi-source advisory aggregation
//!
//! [`Aggregator::fetch`] fans out to every selected source at once, bounded
//! by a semaphore. One source failing never cancels its siblings: each
//! source's error is collected into `per_source_errors` and the rest of the
//! results are still returned.
//!
//! An optional deadline stops *new* source calls from being issued once it
//! passes; calls already in flight are allowed to finish.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::AggregatorConfig;
use crate::sources::{RawAdvisory, RegisteredSource, RiskIndicator};
use crate::utils::error::FetchError;

/// Canonical four-level risk bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Normal,
    Caution,
    Reconsider,
    Avoid,
}

impl RiskLevel {
    /// Map a numeric 1-4 scale; out-of-range values are clamped
    pub fn from_level(level: u8) -> Self {
        match level {
            0 | 1 => Self::Normal,
            2 => Self::Caution,
            3 => Self::Reconsider,
            _ => Self::Avoid,
        }
    }

    /// Map a published phrase
    ///
    /// Unrecognized phrases map to `Caution`.
    pub fn from_phrase(phrase: &str) -> Self {
        static PATTERNS: OnceLock<Vec<(Regex, RiskLevel)>> = OnceLock::new();
        let patterns = PATTERNS.get_or_init(|| {
            [
                (
                    r"(?i)do not travel|advise against all travel|avoid all travel|level\s*4",
                    RiskLevel::Avoid,
                ),
                (
                    r"(?i)reconsider|advise against all but essential|level\s*3",
                    RiskLevel::Reconsider,
                ),
                (
                    r"(?i)increased caution|exercise caution|high degree of caution|level\s*2",
                    RiskLevel::Caution,
                ),
                (
                    r"(?i)normal precautions|no restrictions|level\s*1",
                    RiskLevel::Normal,
                ),
            ]
            .into_iter()
            .filter_map(|(pattern, level)| Regex::new(pattern).ok().map(|re| (re, level)))
            .collect()
        });

        let trimmed = phrase.trim();
        if let Ok(level) = trimmed.parse::<u8>() {
            return Self::from_level(level);
        }

        patterns
            .iter()
            .find(|(re, _)| re.is_match(trimmed))
            .map(|(_, level)| *level)
            .unwrap_or(Self::Caution)
    }

    /// Normalize any source indicator
    pub fn normalize(indicator: &RiskIndicator) -> Self {
        match indicator {
            RiskIndicator::Level(level) => Self::from_level(*level),
            RiskIndicator::Phrase(phrase) => Self::from_phrase(phrase),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Caution => "CAUTION",
            Self::Reconsider => "RECONSIDER",
            Self::Avoid => "AVOID",
        }
    }
}

/// One normalized advisory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryRecord {
    pub source: String,
    pub source_priority: u32,
    pub country: String,
    pub risk_level: RiskLevel,
    /// Indicator as published by the source
    pub source_risk: String,
    pub summary: String,
    pub url: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl AdvisoryRecord {
    fn from_raw(source: &str, priority: u32, raw: RawAdvisory) -> Self {
        Self {
            source: source.to_string(),
            source_priority: priority,
            country: raw.country,
            risk_level: RiskLevel::normalize(&raw.risk),
            source_risk: raw.risk.to_string(),
            summary: raw.summary,
            url: raw.url,
            updated_at: raw.updated_at,
        }
    }
}

/// Best-effort result of a fan-out fetch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    /// True iff at least one source returned data
    pub success: bool,
    pub per_source_errors: BTreeMap<String, String>,
    pub records: Vec<AdvisoryRecord>,
    /// Sources that contributed records, highest priority first
    pub sources_used: Vec<String>,
}

/// Fans out to many sources and merges their advisories
pub struct Aggregator {
    sources: BTreeMap<String, RegisteredSource>,
    max_concurrent: usize,
    default_deadline: Option<Duration>,
}

impl Aggregator {
    pub fn new(sources: BTreeMap<String, RegisteredSource>, config: &AggregatorConfig) -> Self {
        Self {
            sources,
            max_concurrent: config.max_concurrent_sources.max(1),
            default_deadline: config.deadline_secs.map(Duration::from_secs),
        }
    }

    /// Registered sources by name
    pub fn sources(&self) -> &BTreeMap<String, RegisteredSource> {
        &self.sources
    }

    /// Fetch with the configured default deadline
    pub async fn fetch(&self, country: Option<&str>, sources: Option<&[String]>) -> AggregatedResult {
        self.fetch_with_deadline(country, sources, self.default_deadline)
            .await
    }

    /// Fetch from `sources` (or every enabled source) concurrently
    ///
    /// With `country`, each source is asked for that country's advisory;
    /// without it, for all advisories it publishes.
    pub async fn fetch_with_deadline(
        &self,
        country: Option<&str>,
        sources: Option<&[String]>,
        deadline: Option<Duration>,
    ) -> AggregatedResult {
        let mut result = AggregatedResult::default();

        let selected: Vec<RegisteredSource> = match sources {
            Some(names) => {
                let mut selected = Vec::new();
                for name in names {
                    match self.sources.get(name) {
                        Some(source) => selected.push(source.clone()),
                        None => {
                            result
                                .per_source_errors
                                .insert(name.clone(), "unknown source".to_string());
                        }
                    }
                }
                selected
            }
            None => self.sources.values().filter(|s| s.enabled).cloned().collect(),
        };

        let deadline_at = deadline.map(|d| Instant::now() + d);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut handles = Vec::with_capacity(selected.len());

        for source in selected {
            let name = source.name().to_string();
            let permit = match deadline_at {
                Some(at) => {
                    tokio::select! {
                        permit = Arc::clone(&semaphore).acquire_owned() => permit,
                        _ = tokio::time::sleep_until(at) => {
                            warn!(source = %name, "Deadline passed before source was queried");
                            result
                                .per_source_errors
                                .insert(name, "deadline exceeded before request".to_string());
                            continue;
                        }
                    }
                }
                None => Arc::clone(&semaphore).acquire_owned().await,
            };
            let Ok(permit) = permit else {
                result
                    .per_source_errors
                    .insert(name, "aggregator shutting down".to_string());
                continue;
            };

            let country = country.map(str::to_string);
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let fetched = fetch_one(&source, country.as_deref()).await;
                (source, fetched)
            });
            handles.push((name, handle));
        }

        for (name, handle) in handles {
            match handle.await {
                Ok((source, Ok(raws))) => {
                    if raws.is_empty() {
                        continue;
                    }
                    let priority = source.priority;
                    result.records.extend(
                        raws.into_iter()
                            .map(|raw| AdvisoryRecord::from_raw(&name, priority, raw)),
                    );
                    result.sources_used.push(name);
                }
                Ok((_, Err(e))) => {
                    warn!(source = %name, error = %e, "Source failed during aggregation");
                    result.per_source_errors.insert(name, e.to_string());
                }
                Err(join_error) => {
                    warn!(source = %name, error = %join_error, "Source task aborted");
                    result
                        .per_source_errors
                        .insert(name, format!("source task aborted: {join_error}"));
                }
            }
        }

        rank(&mut result, &self.sources);
        result.success = !result.records.is_empty();

        info!(
            country = country.unwrap_or("*"),
            records = result.records.len(),
            sources_used = result.sources_used.len(),
            failed = result.per_source_errors.len(),
            "Aggregation finished"
        );
        result
    }
}

async fn fetch_one(
    source: &RegisteredSource,
    country: Option<&str>,
) -> Result<Vec<RawAdvisory>, FetchError> {
    match country {
        Some(country) => source
            .adapter
            .fetch_country_advisory(country)
            .await
            .map(|raw| vec![raw]),
        None => source.adapter.fetch_all_advisories().await,
    }
}

/// Priority descending, then country ascending
fn rank(result: &mut AggregatedResult, sources: &BTreeMap<String, RegisteredSource>) {
    result.records.sort_by(|a, b| {
        b.source_priority
            .cmp(&a.source_priority)
            .then_with(|| a.country.cmp(&b.country))
            .then_with(|| a.source.cmp(&b.source))
    });

    let priority = |name: &str| sources.get(name).map(|s| s.priority).unwrap_or(0);
    result
        .sources_used
        .sort_by(|a, b| priority(b).cmp(&priority(a)).then_with(|| a.cmp(b)));
}
