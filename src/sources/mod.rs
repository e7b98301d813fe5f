//! Pluggable advisory sources
//!
//! A [`SourceAdapter`] turns one external source into [`RawAdvisory`]
//! records. Site-specific extraction lives behind this trait; the crate
//! ships [`JsonFeedAdapter`] for sources that publish a JSON feed.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::http::CachedHttpClient;
use crate::ratelimit::RateGovernor;
use crate::utils::error::FetchError;

/// Risk indicator exactly as published by a source
///
/// Some sources publish a numeric level (1-4), others a phrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RiskIndicator {
    Level(u8),
    Phrase(String),
}

impl std::fmt::Display for RiskIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Level(level) => write!(f, "{level}"),
            Self::Phrase(phrase) => f.write_str(phrase),
        }
    }
}

/// One advisory as returned by a source, before normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAdvisory {
    pub country: String,
    pub risk: RiskIndicator,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Capability exposed by every advisory source
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Configured source name
    fn name(&self) -> &str;

    /// Advisory for one country
    ///
    /// Returns `FetchError::NotFound` when the source has no advisory for it.
    async fn fetch_country_advisory(&self, country: &str) -> Result<RawAdvisory, FetchError>;

    /// Every advisory the source publishes
    async fn fetch_all_advisories(&self) -> Result<Vec<RawAdvisory>, FetchError>;

    /// Whether the source currently answers
    async fn health_check(&self) -> bool;

    /// Governed client used by this adapter, if it has one
    fn client(&self) -> Option<&CachedHttpClient> {
        None
    }
}

/// Adapter for sources publishing advisories as JSON
///
/// Endpoints, relative to the source's base URL:
/// - `GET advisories/{country}` returns one [`RawAdvisory`]
/// - `GET advisories` returns an array of them
/// - `GET health` answers 2xx when the source is up
pub struct JsonFeedAdapter {
    client: CachedHttpClient,
}

impl JsonFeedAdapter {
    pub fn new(client: CachedHttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn name(&self) -> &str {
        self.client.source()
    }

    async fn fetch_country_advisory(&self, country: &str) -> Result<RawAdvisory, FetchError> {
        let path = format!("advisories/{}", encode_segment(country));
        match self.client.get_json(&path, &[]).await {
            Err(FetchError::Client { status: 404 }) => Err(FetchError::NotFound(country.to_string())),
            other => other,
        }
    }

    async fn fetch_all_advisories(&self) -> Result<Vec<RawAdvisory>, FetchError> {
        self.client.get_json("advisories", &[]).await
    }

    async fn health_check(&self) -> bool {
        match self.client.ping("health").await {
            Ok(response) => (200..300).contains(&response.status_code),
            Err(e) => {
                tracing::debug!(source = %self.name(), error = %e, "Health check failed");
                false
            }
        }
    }

    fn client(&self) -> Option<&CachedHttpClient> {
        Some(&self.client)
    }
}

/// Percent-encode a single path segment
fn encode_segment(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

/// A source adapter together with its ranking priority
#[derive(Clone)]
pub struct RegisteredSource {
    pub adapter: Arc<dyn SourceAdapter>,
    pub priority: u32,
    pub enabled: bool,
}

impl RegisteredSource {
    pub fn name(&self) -> &str {
        self.adapter.name()
    }
}

/// Build JSON-feed adapters for every configured source
///
/// All clients share one rate governor and one response cache.
pub fn build_sources(
    config: &Config,
    governor: Arc<RateGovernor>,
    cache: Arc<dyn ResponseCache>,
) -> Result<BTreeMap<String, RegisteredSource>, FetchError> {
    let mut sources = BTreeMap::new();
    for (name, source_config) in &config.sources {
        let client = CachedHttpClient::new(
            name,
            source_config,
            &config.http,
            Arc::clone(&governor),
            Arc::clone(&cache),
        )?;
        sources.insert(
            name.clone(),
            RegisteredSource {
                adapter: Arc::new(JsonFeedAdapter::new(client)),
                priority: source_config.priority,
                enabled: source_config.enabled,
            },
        );
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_advisory_accepts_numeric_and_phrase_levels() {
        let numeric: RawAdvisory =
            serde_json::from_str(r#"{"country":"France","risk":2,"summary":"Be careful"}"#)
                .unwrap();
        assert_eq!(numeric.risk, RiskIndicator::Level(2));

        let phrase: RawAdvisory = serde_json::from_str(
            r#"{"country":"Mali","risk":"Advise against all travel","url":"https://x.test/mali"}"#,
        )
        .unwrap();
        assert_eq!(
            phrase.risk,
            RiskIndicator::Phrase("Advise against all travel".into())
        );
        assert!(phrase.summary.is_empty());
        assert_eq!(phrase.url.as_deref(), Some("https://x.test/mali"));
    }

    #[test]
    fn test_encode_segment() {
        assert_eq!(encode_segment("France"), "France");
        assert_eq!(encode_segment("Côte d'Ivoire"), "C%C3%B4te%20d%27Ivoire");
        assert_eq!(encode_segment("a/b"), "a%2Fb");
    }
}
