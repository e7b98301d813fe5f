//! Governed HTTP access to one external source
//!
//! [`CachedHttpClient`] wraps every outbound call with:
//! - response caching (cache hits never touch the network or the quota)
//! - rate governance through the shared [`RateGovernor`]
//! - local request pacing with `governor`
//! - circuit-breaker protection
//! - bounded exponential backoff with jitter for transient failures
//!
//! Responses are classified into the [`FetchError`] taxonomy: 401 is
//! `Auth`, 429 is `RateLimited` (carrying Retry-After), 5xx is `Transient`,
//! and any other 4xx is `Client`. Only transient classes are retried.

use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER, USER_AGENT},
    Client, Method, Response,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::cache::{request_key, CachedResponse, ResponseCache};
use crate::config::{HttpConfig, SourceConfig};
use crate::metrics;
use crate::ratelimit::RateGovernor;
use crate::utils::error::FetchError;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Outcome of one logical request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestResult {
    pub status_code: u16,
    pub payload: String,
    pub headers: BTreeMap<String, String>,
    /// Whether the response was served from cache
    pub cached: bool,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl RequestResult {
    /// Decode the payload as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
        serde_json::from_str(&self.payload).map_err(|e| FetchError::Decode(e.to_string()))
    }

    fn from_cache(cached: CachedResponse, response_time_ms: u64) -> Self {
        Self {
            status_code: cached.status_code,
            payload: cached.payload,
            headers: cached.headers,
            cached: true,
            response_time_ms,
            timestamp: Utc::now(),
        }
    }

    fn to_cached(&self) -> CachedResponse {
        CachedResponse {
            status_code: self.status_code,
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            fetched_at: self.timestamp,
        }
    }
}

/// Counters for one client, as reported in health snapshots
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClientStats {
    /// Logical requests (cache hits included)
    pub total_requests: u64,
    /// Network attempts actually sent
    pub network_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Logical requests that ended in an error
    pub errors: u64,
    pub auth_failures: u64,
    pub total_response_ms: u64,
}

impl ClientStats {
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.total_requests as f64
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    pub fn avg_response_ms(&self) -> f64 {
        if self.network_requests == 0 {
            0.0
        } else {
            self.total_response_ms as f64 / self.network_requests as f64
        }
    }
}

/// Cached, governed, breaker-protected HTTP client for one source
pub struct CachedHttpClient {
    source: String,
    base_url: url::Url,
    client: Client,
    pacer: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    governor: Arc<RateGovernor>,
    breaker: CircuitBreaker,
    cache: Arc<dyn ResponseCache>,
    retry: RetryConfig,
    default_ttl: Duration,
    api_key: Option<String>,
    stats: Mutex<ClientStats>,
}

impl CachedHttpClient {
    /// Create a client for `source`
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidUrl` for a bad base URL and
    /// `FetchError::Http` if the HTTP client cannot be created
    pub fn new(
        source: &str,
        source_config: &SourceConfig,
        http: &HttpConfig,
        governor: Arc<RateGovernor>,
        cache: Arc<dyn ResponseCache>,
    ) -> Result<Self, FetchError> {
        let base_url = normalize_base(&source_config.base_url)?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(agent) = HeaderValue::from_str(&http.user_agent) {
            headers.insert(USER_AGENT, agent);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(http.request_timeout_secs))
            .default_headers(headers)
            .gzip(true)
            .build()?;

        let rate = NonZeroU32::new(http.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let pacer = RateLimiter::direct(Quota::per_second(rate));

        let retry = RetryConfig::with_delays(
            http.max_attempts,
            http.retry_base_delay_ms,
            http.retry_max_delay_ms,
        );

        Ok(Self {
            source: source.to_string(),
            base_url,
            client,
            pacer,
            governor,
            breaker: CircuitBreaker::new(
                source,
                source_config.circuit_failure_threshold,
                source_config.recovery_timeout(),
            ),
            cache,
            retry,
            default_ttl: source_config.cache_ttl(),
            api_key: source_config.api_key.clone(),
            stats: Mutex::new(ClientStats::default()),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn base_url(&self) -> &url::Url {
        &self.base_url
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Snapshot of this client's counters
    pub fn stats(&self) -> ClientStats {
        *self.stats_mut()
    }

    fn stats_mut(&self) -> MutexGuard<'_, ClientStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// GET `path` with the source's default cache TTL
    pub async fn get(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<RequestResult, FetchError> {
        self.request(Method::GET, path, params, None).await
    }

    /// GET `path` and decode the JSON payload
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<T, FetchError> {
        self.get(path, params).await?.json()
    }

    /// Issue a request against the source
    ///
    /// `ttl` overrides the source's default cache TTL for a successful
    /// response.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<RequestResult, FetchError> {
        let started = Instant::now();
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| FetchError::InvalidUrl(format!("{path}: {e}")))?;

        self.stats_mut().total_requests += 1;

        let key = request_key(method.as_str(), url.as_str(), params, &self.source)
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        match self.cache.get(&key).await {
            Ok(Some(hit)) => {
                self.stats_mut().cache_hits += 1;
                metrics::record_cache_lookup(&self.source, true);
                debug!(source = %self.source, url = %url, "Cache hit");
                return Ok(RequestResult::from_cache(
                    hit,
                    started.elapsed().as_millis() as u64,
                ));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(source = %self.source, error = %e, "Cache lookup failed, treating as miss");
            }
        }
        self.stats_mut().cache_misses += 1;
        metrics::record_cache_lookup(&self.source, false);

        let url_ref = &url;
        let result = with_retry_if(
            &self.retry,
            || {
                let method = method.clone();
                async move { self.governed_attempt(method, url_ref, params).await }
            },
            FetchError::is_retryable,
            FetchError::retry_after,
        )
        .await;

        match result {
            Ok(response) => {
                let ttl = ttl.unwrap_or(self.default_ttl);
                if !ttl.is_zero() {
                    if let Err(e) = self.cache.store(&key, &response.to_cached(), ttl).await {
                        warn!(source = %self.source, error = %e, "Failed to cache response");
                    }
                }
                Ok(response)
            }
            Err(e) => {
                {
                    let mut stats = self.stats_mut();
                    stats.errors += 1;
                    if matches!(e, FetchError::Auth) {
                        stats.auth_failures += 1;
                    }
                }
                metrics::record_source_error(&self.source, e.kind());
                Err(e)
            }
        }
    }

    /// One network attempt: breaker admission, rate slot, pacing, then the call
    async fn governed_attempt(
        &self,
        method: Method,
        url: &url::Url,
        params: &[(String, String)],
    ) -> Result<RequestResult, FetchError> {
        // Admit first so a refused call never spends quota
        let permit = self.breaker.admit()?;

        let waited = self.governor.acquire(&self.source).await?;
        metrics::record_rate_wait(&self.source, waited.as_secs_f64());

        self.pacer.until_ready().await;

        let started = Instant::now();
        let result = self.send(method, url, params).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        permit.record(&result);

        self.governor.observe_latency(&self.source, elapsed_ms);
        {
            let mut stats = self.stats_mut();
            stats.network_requests += 1;
            stats.total_response_ms += elapsed_ms;
        }

        result.map(|mut response| {
            response.response_time_ms = elapsed_ms;
            response
        })
    }

    /// Single uncached GET for liveness checks
    ///
    /// Paced locally, but outside the breaker, the hourly quota and the
    /// retry loop, so a failing check never opens the breaker or spends
    /// the source's allowance.
    pub async fn ping(&self, path: &str) -> Result<RequestResult, FetchError> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| FetchError::InvalidUrl(format!("{path}: {e}")))?;

        self.pacer.until_ready().await;
        self.send(Method::GET, &url, &[]).await
    }

    async fn send(
        &self,
        method: Method,
        url: &url::Url,
        params: &[(String, String)],
    ) -> Result<RequestResult, FetchError> {
        let mut builder = self.client.request(method, url.clone());
        if !params.is_empty() {
            builder = builder.query(params);
        }
        if let Some(key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {key}"));
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Http(e)
            }
        })?;

        let status = response.status().as_u16();
        metrics::record_request(&self.source, status, started.elapsed().as_secs_f64());

        if !response.status().is_success() {
            let retry_after = parse_retry_after(response.headers());
            let error = FetchError::from_status(status, retry_after);
            debug!(source = %self.source, url = %url, status, error = %error, "Request failed");
            return Err(error);
        }

        decode_response(response, started).await
    }
}

async fn decode_response(response: Response, started: Instant) -> Result<RequestResult, FetchError> {
    let status_code = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let payload = response.text().await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Http(e)
        }
    })?;

    Ok(RequestResult {
        status_code,
        payload,
        headers,
        cached: false,
        response_time_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
    })
}

/// Base URLs always end with `/` so relative joins keep their path prefix
fn normalize_base(base: &str) -> Result<url::Url, FetchError> {
    let mut base = base.trim().to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    url::Url::parse(&base).map_err(|e| FetchError::InvalidUrl(format!("{base}: {e}")))
}

/// Parse a Retry-After header given in seconds or as an HTTP date
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw).ok()?;
    Some(
        (at.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO),
    )
}
