//! Prometheus metrics for wayfarer source access and job execution
//!
//! This module provides metrics tracking for:
//! - Source access: request latency, cache hits/misses, errors by type, breaker state
//! - Jobs: outcomes by task kind, retries, dead letters, queue depth
//!
//! Time-windowed health statistics computed from persisted job records live
//! in [`rollup`].
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

pub mod rollup;

pub use rollup::MetricsAggregator;

use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

use crate::breaker::BreakerState;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all source access metrics
struct SourceMetrics {
    request_duration: HistogramVec,
    requests: CounterVec,
    cache_hits: CounterVec,
    cache_misses: CounterVec,
    errors: CounterVec,
    breaker_state: GaugeVec,
    rate_wait: HistogramVec,
}

/// Container for all job metrics
struct JobMetrics {
    job_duration: HistogramVec,
    outcomes: CounterVec,
    retries: CounterVec,
    dead_letters: CounterVec,
    dead_letter_requeues: CounterVec,
    manual_interventions: CounterVec,
    queue_depth: Gauge,
}

/// Global storage for source metrics
static SOURCE_METRICS: OnceLock<SourceMetrics> = OnceLock::new();

/// Global storage for job metrics
static JOB_METRICS: OnceLock<JobMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, errors are logged and subsequent
/// metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = wayfarer::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let source = SourceMetrics {
        request_duration: register_histogram_vec!(
            "wayfarer_source_request_duration_seconds",
            "Outbound request latency in seconds",
            &["source"],
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        )?,
        requests: register_counter_vec!(
            "wayfarer_source_requests_total",
            "Total outbound requests by source and HTTP status",
            &["source", "status"]
        )?,
        cache_hits: register_counter_vec!(
            "wayfarer_source_cache_hits_total",
            "Responses served from cache",
            &["source"]
        )?,
        cache_misses: register_counter_vec!(
            "wayfarer_source_cache_misses_total",
            "Cache lookups that required a network call",
            &["source"]
        )?,
        errors: register_counter_vec!(
            "wayfarer_source_errors_total",
            "Outbound request errors by source and error type",
            &["source", "error_type"]
        )?,
        breaker_state: register_gauge_vec!(
            "wayfarer_source_breaker_state",
            "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)",
            &["source"]
        )?,
        rate_wait: register_histogram_vec!(
            "wayfarer_source_rate_wait_seconds",
            "Time spent waiting on the rate governor",
            &["source"],
            vec![0.0, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
        )?,
    };

    let jobs = JobMetrics {
        job_duration: register_histogram_vec!(
            "wayfarer_job_duration_seconds",
            "Job execution time in seconds",
            &["task_kind"],
            vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]
        )?,
        outcomes: register_counter_vec!(
            "wayfarer_job_outcomes_total",
            "Job attempts by task kind and resulting status",
            &["task_kind", "status"]
        )?,
        retries: register_counter_vec!(
            "wayfarer_job_retries_total",
            "Job attempts scheduled for retry",
            &["source"]
        )?,
        dead_letters: register_counter_vec!(
            "wayfarer_dead_letters_total",
            "Jobs moved to the dead-letter queue",
            &["task_kind"]
        )?,
        dead_letter_requeues: register_counter_vec!(
            "wayfarer_dead_letter_requeues_total",
            "Dead-letter records resubmitted as new jobs",
            &["task_kind"]
        )?,
        manual_interventions: register_counter_vec!(
            "wayfarer_dead_letter_manual_total",
            "Dead-letter records flagged for manual review",
            &["task_kind"]
        )?,
        queue_depth: register_gauge!(
            "wayfarer_job_queue_depth",
            "Jobs waiting in the local queue"
        )?,
    };

    SOURCE_METRICS
        .set(source)
        .map_err(|_| "Source metrics already initialized")?;
    JOB_METRICS
        .set(jobs)
        .map_err(|_| "Job metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    SOURCE_METRICS.get().is_some() && JOB_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a completed network request
pub fn record_request(source: &str, status: u16, duration_secs: f64) {
    let Some(m) = SOURCE_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.requests.with_label_values(&[source, &status_str]).inc();
    m.request_duration
        .with_label_values(&[source])
        .observe(duration_secs);
}

/// Record a cache lookup
pub fn record_cache_lookup(source: &str, hit: bool) {
    let Some(m) = SOURCE_METRICS.get() else {
        return;
    };

    if hit {
        m.cache_hits.with_label_values(&[source]).inc();
    } else {
        m.cache_misses.with_label_values(&[source]).inc();
    }
}

/// Record a failed request by error type
pub fn record_source_error(source: &str, error_type: &str) {
    if let Some(m) = SOURCE_METRICS.get() {
        m.errors.with_label_values(&[source, error_type]).inc();
    }
}

/// Publish a breaker state change
pub fn set_breaker_state(source: &str, state: BreakerState) {
    if let Some(m) = SOURCE_METRICS.get() {
        m.breaker_state
            .with_label_values(&[source])
            .set(state.gauge_value() as f64);
    }
}

/// Record time spent blocked on the rate governor
pub fn record_rate_wait(source: &str, wait_secs: f64) {
    if let Some(m) = SOURCE_METRICS.get() {
        m.rate_wait.with_label_values(&[source]).observe(wait_secs);
    }
}

/// Record the status a job attempt ended in
pub fn record_job_outcome(task_kind: &str, status: &str) {
    if let Some(m) = JOB_METRICS.get() {
        m.outcomes.with_label_values(&[task_kind, status]).inc();
    }
}

/// Record a job scheduled for retry
pub fn record_job_retry(source: &str) {
    if let Some(m) = JOB_METRICS.get() {
        m.retries.with_label_values(&[source]).inc();
    }
}

/// Record a dead-lettered job
pub fn record_dead_letter(task_kind: &str) {
    if let Some(m) = JOB_METRICS.get() {
        m.dead_letters.with_label_values(&[task_kind]).inc();
    }
}

/// Record the outcome of dead-letter processing for one record
pub fn record_dead_letter_decision(task_kind: &str, requeued: bool) {
    let Some(m) = JOB_METRICS.get() else {
        return;
    };

    if requeued {
        m.dead_letter_requeues.with_label_values(&[task_kind]).inc();
    } else {
        m.manual_interventions.with_label_values(&[task_kind]).inc();
    }
}

/// Update the local queue depth gauge
pub fn set_queue_depth(depth: usize) {
    if let Some(m) = JOB_METRICS.get() {
        m.queue_depth.set(depth as f64);
    }
}

/// Histogram timer guard that records duration on drop
pub struct MetricsTimer {
    timer: Option<prometheus::HistogramTimer>,
}

impl MetricsTimer {
    fn new(timer: prometheus::HistogramTimer) -> Self {
        Self { timer: Some(timer) }
    }

    /// Create a no-op timer when metrics are not initialized
    fn noop() -> Self {
        Self { timer: None }
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop_and_record();
        }
    }
}

/// Start a job timer (returns a timer handle)
pub fn start_job_timer(task_kind: &str) -> MetricsTimer {
    match JOB_METRICS.get() {
        Some(m) => MetricsTimer::new(m.job_duration.with_label_values(&[task_kind]).start_timer()),
        None => MetricsTimer::noop(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok());

        // Second call should also be Ok (idempotent)
        let result2 = init_metrics();
        assert!(result2.is_ok());
    }

    #[test]
    fn test_metrics_initialized() {
        ensure_metrics_initialized();
        assert!(metrics_initialized());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_request("us_state", 200, 0.12);
        let text = encode_metrics().unwrap();
        assert!(text.contains("wayfarer_source_requests_total"));
    }

    #[test]
    fn test_source_metrics() {
        ensure_metrics_initialized();
        record_cache_lookup("us_state", true);
        record_cache_lookup("us_state", false);
        record_source_error("uk_fcdo", "transient");
        set_breaker_state("uk_fcdo", BreakerState::Open);
        record_rate_wait("uk_fcdo", 1.5);
    }

    #[test]
    fn test_job_metrics() {
        ensure_metrics_initialized();
        record_job_outcome("fetch_country", "SUCCESS");
        record_job_retry("us_state");
        record_dead_letter("fetch_source");
        record_dead_letter_decision("fetch_source", true);
        record_dead_letter_decision("fetch_source", false);
        set_queue_depth(4);
        let _timer = start_job_timer("fetch_all");
    }
}
