//! Retry utilities for resilient operations
//!
//! This module provides bounded exponential backoff with jitter, shared by
//! the cached HTTP client (request-level retries) and the job worker
//! (task-level retries).

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,

    /// Fraction of the computed delay added as random jitter (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom attempt count
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Create a retry configuration with custom delays
    pub fn with_delays(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            ..Default::default()
        }
    }

    /// Disable jitter (deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Un-jittered delay before retry number `retry` (1-based)
    ///
    /// `base * multiplier^(retry - 1)`, capped at `max_delay_ms`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponential =
            self.base_delay_ms as f64 * self.backoff_multiplier.powi((retry - 1) as i32);
        Duration::from_millis((exponential as u64).min(self.max_delay_ms))
    }

    /// Jittered delay before retry number `retry`, still capped at `max_delay_ms`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = (base.as_millis() as f64 * self.jitter.min(1.0)) as u64;
        let extra = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        Duration::from_millis((base.as_millis() as u64 + extra).min(self.max_delay_ms))
    }
}

/// Execute an operation with retry logic, using a custom retry predicate
///
/// The operation runs at most `config.max_attempts` times. Errors for which
/// `should_retry` returns `false` are returned immediately. `wait_hint` may
/// supply a server-provided minimum wait (e.g. Retry-After) for an error;
/// the hint is a floor and may exceed `max_delay_ms`.
///
/// # Example
///
/// ```no_run
/// use wayfarer::utils::retry::{with_retry_if, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::new(3);
/// let value = with_retry_if(
///     &config,
///     || async { Ok::<_, String>(42) },
///     |e: &String| e.contains("temporary"),
///     |_| None,
/// )
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_retry_if<T, E, F, Fut, P, H>(
    config: &RetryConfig,
    operation: F,
    should_retry: P,
    wait_hint: H,
) -> Result<T, E>
where
    E: Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    H: Fn(&E) -> Option<Duration>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    debug!(error = %e, "Non-retryable error encountered");
                    return Err(e);
                }
                if attempt >= attempts {
                    warn!(attempt, max_attempts = attempts, error = %e, "Retries exhausted");
                    return Err(e);
                }

                let backoff = config.delay_for(attempt);
                let delay = match wait_hint(&e) {
                    Some(hint) => backoff.max(hint),
                    None => backoff,
                };
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
