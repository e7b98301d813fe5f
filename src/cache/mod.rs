//! Response caching for outbound source requests
//!
//! This module provides the cache consulted by the cached HTTP client
//! before any network call:
//! - [`InMemoryCache`]: process-local map with per-entry expiry
//! - [`RedisCache`]: shared Redis store, expiry enforced by Redis `SETEX`
//!
//! Entries are immutable per key and TTL, so both stores are safe to share
//! between concurrent callers. An entry is never served past its expiry.
//!
//! # Example
//!
//! ```rust,ignore
//! use wayfarer::cache::{from_settings, request_key};
//!
//! let cache = from_settings(&config.cache).await;
//! let key = request_key("GET", "https://example.org/advisories", &[], "us_state")?;
//! if let Some(hit) = cache.get(&key).await? { /* ... */ }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::CacheSettings;

/// Errors raised by cache backends
#[derive(Error, Debug)]
pub enum CacheError {
    /// Redis command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Could not obtain a pooled connection
    #[error("Redis pool error: {0}")]
    Pool(String),

    /// Cached value could not be (de)serialized
    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Request URL could not be normalized into a key
    #[error("Invalid cache key URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// A successful response as stored in the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status_code: u16,
    pub payload: String,
    pub headers: BTreeMap<String, String>,
    /// When the response was originally received
    pub fetched_at: DateTime<Utc>,
}

/// One cached value with its absolute expiry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: CachedResponse,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry may no longer be served at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Cache backend used by the HTTP client
#[async_trait]
pub trait ResponseCache: Send + Sync {
    /// Unexpired value for `key`, if any
    async fn get(&self, key: &str) -> CacheResult<Option<CachedResponse>>;

    /// Store `value` under `key` for `ttl`
    async fn store(&self, key: &str, value: &CachedResponse, ttl: Duration) -> CacheResult<()>;

    /// Drop `key`
    async fn invalidate(&self, key: &str) -> CacheResult<()>;

    /// Short backend label for logs
    fn backend(&self) -> &'static str;
}

// =========================================================================
// Key Generation
// =========================================================================

/// Deterministic cache key for a request
///
/// The URL is normalized (fragment dropped, query parameters merged with
/// `params` and sorted) and hashed together with the method and the
/// identity of the client issuing the request.
pub fn request_key(
    method: &str,
    url: &str,
    params: &[(String, String)],
    client_identity: &str,
) -> CacheResult<String> {
    let mut parsed = url::Url::parse(url)?;
    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .chain(params.iter().cloned())
        .collect();
    pairs.sort();
    parsed.set_query(None);

    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(parsed.as_str().as_bytes());
    for (k, v) in &pairs {
        hasher.update(b"\n");
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }
    hasher.update(b"\n");
    hasher.update(client_identity.as_bytes());

    Ok(format!("{:x}", hasher.finalize()))
}

// =========================================================================
// In-memory backend
// =========================================================================

/// Process-local cache
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lookup evaluated at an explicit instant; expired entries are evicted
    pub fn get_at(&self, key: &str, now: DateTime<Utc>) -> Option<CachedResponse> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert evaluated at an explicit instant
    pub fn store_at(&self, key: &str, value: &CachedResponse, ttl: Duration, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entries().insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value: value.clone(),
                expires_at,
            },
        );
    }

    /// Remove every expired entry; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        before - entries.len()
    }

    /// Number of stored entries (including not yet purged expired ones)
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResponseCache for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<CachedResponse>> {
        Ok(self.get_at(key, Utc::now()))
    }

    async fn store(&self, key: &str, value: &CachedResponse, ttl: Duration) -> CacheResult<()> {
        self.store_at(key, value, ttl, Utc::now());
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.entries().remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// =========================================================================
// Redis backend
// =========================================================================

/// Redis-backed cache shared by all worker processes
pub struct RedisCache {
    pool: Pool,
    key_prefix: String,
}

impl RedisCache {
    /// Connect to Redis and verify the connection
    pub async fn new(url: &str, key_prefix: &str) -> CacheResult<Self> {
        let pool = PoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Pool(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

        tracing::info!(url = %url, "Connected to Redis");

        Ok(Self {
            pool,
            key_prefix: key_prefix.to_string(),
        })
    }

    /// Create a cache instance, returning None if Redis is unavailable
    pub async fn try_new(url: &str, key_prefix: &str) -> Option<Self> {
        match Self::new(url, key_prefix).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(error = %e, "Redis cache unavailable, falling back to in-memory cache");
                None
            }
        }
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:http:{}", self.key_prefix, key)
    }

    async fn conn(&self) -> CacheResult<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Pool(e.to_string()))
    }

    /// Check if cache is healthy
    pub async fn health_check(&self) -> CacheResult<bool> {
        let mut conn = self.conn().await?;
        let result: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(result == "PONG")
    }
}

#[async_trait]
impl ResponseCache for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<CachedResponse>> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.get(self.namespaced(key)).await?;
        match value {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, key: &str, value: &CachedResponse, ttl: Duration) -> CacheResult<()> {
        // SETEX has second granularity; never round a TTL up past what was asked
        let secs = ttl.as_secs();
        if secs == 0 {
            return Ok(());
        }
        let bytes = serde_json::to_vec(value)?;
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(self.namespaced(key), bytes, secs)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.namespaced(key)).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

/// Build the configured cache, degrading to in-memory if Redis is unreachable
pub async fn from_settings(settings: &CacheSettings) -> Arc<dyn ResponseCache> {
    if let Some(url) = &settings.redis_url {
        if let Some(cache) = RedisCache::try_new(url, &settings.key_prefix).await {
            return Arc::new(cache);
        }
    }
    Arc::new(InMemoryCache::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(body: &str) -> CachedResponse {
        CachedResponse {
            status_code: 200,
            payload: body.to_string(),
            headers: BTreeMap::new(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn test_request_key_is_deterministic() {
        let a = request_key(
            "get",
            "https://Example.org/advisories?b=2&a=1#top",
            &[],
            "us_state",
        )
        .unwrap();
        let b = request_key(
            "GET",
            "https://example.org/advisories?a=1",
            &[("b".into(), "2".into())],
            "us_state",
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other_client =
            request_key("GET", "https://example.org/advisories?a=1&b=2", &[], "uk_fcdo").unwrap();
        assert_ne!(a, other_client);

        let other_method =
            request_key("POST", "https://example.org/advisories?a=1&b=2", &[], "us_state")
                .unwrap();
        assert_ne!(a, other_method);
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            request_key("GET", "not a url", &[], "x"),
            Err(CacheError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_entry_never_served_past_expiry() {
        let cache = InMemoryCache::new();
        let now = Utc::now();
        let value = response("{\"level\":2}");
        cache.store_at("k", &value, Duration::from_secs(60), now);

        assert_eq!(
            cache.get_at("k", now + chrono::Duration::seconds(59)),
            Some(value)
        );
        assert_eq!(cache.get_at("k", now + chrono::Duration::seconds(60)), None);
        // Expired entry was evicted on lookup
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_store_then_get_round_trip() {
        let cache = InMemoryCache::new();
        let value = response("payload");
        cache
            .store("key", &value, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(cache.get("key").await.unwrap(), Some(value));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_and_purge() {
        let cache = InMemoryCache::new();
        cache
            .store("a", &response("a"), Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .store("b", &response("b"), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(cache.purge_expired(), 1);
        cache.invalidate("a").await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_from_settings_without_redis_is_in_memory() {
        let cache = from_settings(&CacheSettings::default()).await;
        assert_eq!(cache.backend(), "memory");
    }

    // Integration tests require running Redis
    #[tokio::test]
    #[ignore = "Requires running Redis"]
    async fn test_redis_round_trip() {
        let cache = RedisCache::new("redis://localhost:6379", "wayfarer-test")
            .await
            .unwrap();
        let value = response("payload");
        cache
            .store("round-trip", &value, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cache.get("round-trip").await.unwrap(), Some(value));
        assert!(cache.health_check().await.unwrap());
    }
}
