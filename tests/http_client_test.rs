//! Integration tests for CachedHttpClient using wiremock
//!
//! These tests validate caching, retry classification, Retry-After
//! handling and breaker behavior against mock servers.

mod common;

use std::time::{Duration, Instant};

use wayfarer::breaker::BreakerState;
use wayfarer::utils::error::FetchError;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{client, fast_http, source_config};

/// A cached response is served without a second network call
#[tokio::test]
async fn test_cache_hit_skips_network() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories/France"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"country":"France","risk":1}"#))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client("gov", &source_config(&mock_server.uri()), &fast_http(3));

    let first = client.get("advisories/France", &[]).await.unwrap();
    assert!(!first.cached);

    let second = client.get("advisories/France", &[]).await.unwrap();
    assert!(second.cached, "Second request should be served from cache");
    assert_eq!(second.payload, first.payload);

    let stats = client.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.network_requests, 1);
}

/// Query parameters are part of the cache key
#[tokio::test]
async fn test_different_params_are_cached_separately() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(2)
        .mount(&mock_server)
        .await;

    let client = client("gov", &source_config(&mock_server.uri()), &fast_http(3));

    let page1 = vec![("page".to_string(), "1".to_string())];
    let page2 = vec![("page".to_string(), "2".to_string())];
    client.get("advisories", &page1).await.unwrap();
    client.get("advisories", &page2).await.unwrap();
    assert!(client.get("advisories", &page1).await.unwrap().cached);
}

/// A zero TTL disables caching
#[tokio::test]
async fn test_zero_ttl_is_never_cached() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(2)
        .mount(&mock_server)
        .await;

    let mut source = source_config(&mock_server.uri());
    source.cache_ttl_secs = 0;
    let client = client("gov", &source, &fast_http(3));

    assert!(!client.get("advisories", &[]).await.unwrap().cached);
    assert!(!client.get("advisories", &[]).await.unwrap().cached);
}

/// 401 is never retried and is counted as an auth failure
#[tokio::test]
async fn test_auth_failure_not_retried() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client("gov", &source_config(&mock_server.uri()), &fast_http(3));
    let result = client.get("advisories", &[]).await;

    assert!(matches!(result, Err(FetchError::Auth)));
    assert_eq!(client.stats().auth_failures, 1);
    assert_eq!(client.stats().errors, 1);
}

/// The API key travels as a bearer token
#[tokio::test]
async fn test_api_key_sent_as_bearer() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .and(header("authorization", "Bearer secret-key"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut source = source_config(&mock_server.uri());
    source.api_key = Some("secret-key".to_string());
    let client = client("gov", &source, &fast_http(1));

    assert!(client.get("advisories", &[]).await.is_ok());
}

/// Server errors are retried until one succeeds
#[tokio::test]
async fn test_server_error_retry() {
    let mock_server = MockServer::start().await;

    // Return 503 twice, then succeed
    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&mock_server)
        .await;

    let client = client("gov", &source_config(&mock_server.uri()), &fast_http(3));
    let result = client.get("advisories", &[]).await;

    assert!(result.is_ok(), "Should succeed after retries: {:?}", result.err());
    assert_eq!(client.stats().network_requests, 3);
}

/// Retries stop at max_attempts
#[tokio::test]
async fn test_max_attempts_exceeded() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = client("gov", &source_config(&mock_server.uri()), &fast_http(3));
    let result = client.get("advisories", &[]).await;

    assert!(matches!(result, Err(FetchError::Transient { status: 500 })));
}

/// 404 is a client error and is not retried
#[tokio::test]
async fn test_404_no_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client("gov", &source_config(&mock_server.uri()), &fast_http(3));
    let result = client.get("missing", &[]).await;

    assert!(matches!(result, Err(FetchError::Client { status: 404 })));
}

/// A 429 waits at least the Retry-After value, even past the backoff cap
#[tokio::test]
async fn test_rate_limited_honors_retry_after() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&mock_server)
        .await;

    // fast_http caps backoff at 5ms; the server hint still wins
    let client = client("gov", &source_config(&mock_server.uri()), &fast_http(2));

    let started = Instant::now();
    let result = client.get("advisories", &[]).await;

    assert!(result.is_ok());
    assert!(
        started.elapsed() >= Duration::from_millis(950),
        "Retry-After should delay the retry, elapsed {:?}",
        started.elapsed()
    );
}

/// Consecutive transient failures open the breaker; further calls fail fast
#[tokio::test]
async fn test_breaker_opens_and_fails_fast() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&mock_server)
        .await;

    let mut source = source_config(&mock_server.uri());
    source.circuit_failure_threshold = 2;
    source.circuit_recovery_timeout_seconds = 60;
    let client = client("gov", &source, &fast_http(1));

    assert!(client.get("advisories", &[]).await.is_err());
    assert_eq!(client.breaker_state(), BreakerState::Closed);
    assert!(client.get("advisories", &[]).await.is_err());
    assert_eq!(client.breaker_state(), BreakerState::Open);

    let result = client.get("advisories", &[]).await;
    assert!(matches!(result, Err(FetchError::BreakerOpen { .. })));
}

/// Client errors do not count against the breaker
#[tokio::test]
async fn test_client_errors_do_not_trip_breaker() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&mock_server)
        .await;

    let mut source = source_config(&mock_server.uri());
    source.circuit_failure_threshold = 2;
    let client = client("gov", &source, &fast_http(1));

    for _ in 0..4 {
        assert!(client.get("advisories", &[]).await.is_err());
    }
    assert_eq!(client.breaker_state(), BreakerState::Closed);
}

/// Every network call is booked in the durable hourly window
#[tokio::test]
async fn test_requests_booked_against_hourly_window() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&mock_server)
        .await;

    let store = common::memory_store();
    let source = source_config(&mock_server.uri());
    let governor = common::governor(&store, &[("gov", &source)]);
    let cache: std::sync::Arc<dyn wayfarer::cache::ResponseCache> =
        std::sync::Arc::new(wayfarer::cache::InMemoryCache::new());
    let client = wayfarer::http::CachedHttpClient::new(
        "gov",
        &source,
        &fast_http(1),
        std::sync::Arc::clone(&governor),
        cache,
    )
    .unwrap();

    client.get("advisories", &[]).await.unwrap();
    // Served from cache, no quota spent
    client.get("advisories", &[]).await.unwrap();

    let window = governor.current_window("gov").unwrap().expect("window booked");
    assert_eq!(window.requests_made, 1);
}

/// Calls refused by an open breaker are not booked against the hourly window
#[tokio::test]
async fn test_open_breaker_spends_no_quota() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/advisories"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&mock_server)
        .await;

    let store = common::memory_store();
    let mut source = source_config(&mock_server.uri());
    source.circuit_failure_threshold = 2;
    source.circuit_recovery_timeout_seconds = 60;
    let governor = common::governor(&store, &[("gov", &source)]);
    let cache: std::sync::Arc<dyn wayfarer::cache::ResponseCache> =
        std::sync::Arc::new(wayfarer::cache::InMemoryCache::new());
    let client = wayfarer::http::CachedHttpClient::new(
        "gov",
        &source,
        &fast_http(1),
        std::sync::Arc::clone(&governor),
        cache,
    )
    .unwrap();

    assert!(client.get("advisories", &[]).await.is_err());
    assert!(client.get("advisories", &[]).await.is_err());
    assert_eq!(client.breaker_state(), BreakerState::Open);

    for _ in 0..3 {
        let result = client.get("advisories", &[]).await;
        assert!(matches!(result, Err(FetchError::BreakerOpen { .. })));
    }

    let window = governor.current_window("gov").unwrap().expect("window booked");
    assert_eq!(window.requests_made, 2);
    assert_eq!(client.stats().network_requests, 2);
}
