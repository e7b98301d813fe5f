//! Circuit breaker for outbound source calls
//!
//! ```text
//!            failures >= threshold
//!   CLOSED ─────────────────────────▶ OPEN
//!     ▲                                 │ recovery timeout elapsed
//!     │ trial succeeds                  ▼
//!     └──────────────────────────── HALF_OPEN ── trial fails ──▶ OPEN
//! ```
//!
//! While OPEN, calls are rejected with [`FetchError::BreakerOpen`] without
//! running the wrapped future. In HALF_OPEN exactly one trial call is let
//! through; concurrent callers are rejected until it finishes. Callers hold
//! a [`Permit`] for the duration of a call. A permit dropped without an
//! outcome (e.g. a cancelled future) releases the trial slot.
//!
//! Breaker state is kept per process. Workers in separate processes each
//! hold their own breaker for a source.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::metrics;
use crate::utils::error::FetchError;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    /// Gauge value exported to metrics
    pub fn gauge_value(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Per-source circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

/// Admission granted by [`CircuitBreaker::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal call while CLOSED
    Normal,
    /// The single HALF_OPEN trial call
    Trial,
}

/// Outstanding admission to call through a [`CircuitBreaker`]
#[must_use = "a permit must be settled with the outcome of the call"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Permit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    /// The call succeeded
    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.on_success(self.admission);
    }

    /// The call failed in a way that reflects on source health
    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.admission);
    }

    /// Settle the permit from a call result
    pub fn record<T>(self, result: &Result<T, FetchError>) {
        match result {
            Ok(_) => self.succeed(),
            Err(e) if e.trips_breaker() => self.fail(),
            // Dropped unsettled: neutral
            Err(_) => {}
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_neutral(self.admission);
        }
    }
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state, promoting OPEN to HALF_OPEN once the timeout elapsed
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner();
        self.refresh(&mut inner);
        inner.state
    }

    /// Consecutive failures counted so far
    pub fn failure_count(&self) -> u32 {
        self.inner().failure_count
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open
            && inner
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.recovery_timeout)
        {
            self.transition(inner, BreakerState::HalfOpen);
        }
    }

    fn transition(&self, inner: &mut Inner, next: BreakerState) {
        if inner.state == next {
            return;
        }
        let previous = inner.state;
        inner.state = next;
        match next {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                warn!(
                    source = %self.name,
                    failures = inner.failure_count,
                    from = %previous,
                    "Circuit breaker opened"
                );
            }
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                info!(source = %self.name, "Circuit breaker half-open, allowing a trial call");
            }
            BreakerState::Closed => {
                inner.failure_count = 0;
                inner.opened_at = None;
                info!(source = %self.name, "Circuit breaker closed");
            }
        }
        metrics::set_breaker_state(&self.name, next);
    }

    /// Ask for permission to make a call
    ///
    /// The returned permit must be settled with the call's outcome; dropping
    /// it unsettled counts as neither success nor failure.
    pub fn admit(&self) -> Result<Permit<'_>, FetchError> {
        let mut inner = self.inner();
        self.refresh(&mut inner);

        let admission = match inner.state {
            BreakerState::Closed => Admission::Normal,
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Admission::Trial
            }
            _ => {
                return Err(FetchError::BreakerOpen {
                    source_name: self.name.clone(),
                })
            }
        };

        Ok(Permit {
            breaker: self,
            admission,
            settled: false,
        })
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner();
        match admission {
            Admission::Trial => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, BreakerState::Closed);
            }
            Admission::Normal => inner.failure_count = 0,
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner();
        inner.failure_count = inner.failure_count.saturating_add(1);
        match admission {
            Admission::Trial => {
                inner.trial_in_flight = false;
                self.transition(&mut inner, BreakerState::Open);
            }
            Admission::Normal => {
                if inner.state == BreakerState::Closed && inner.failure_count >= self.threshold {
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
        }
    }

    fn on_neutral(&self, admission: Admission) {
        if admission == Admission::Trial {
            let mut inner = self.inner();
            inner.trial_in_flight = false;
        }
    }

    /// Run `operation` under breaker protection
    ///
    /// Errors for which [`FetchError::trips_breaker`] is false (auth,
    /// client errors) neither count as failures nor close the breaker.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, FetchError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let permit = self.admit()?;
        let result = operation().await;
        permit.record(&result);
        result
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        let mut inner = self.inner();
        inner.trial_in_flight = false;
        self.transition(&mut inner, BreakerState::Closed);
        inner.failure_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn fail(breaker: &CircuitBreaker) -> Result<(), FetchError> {
        breaker
            .call(|| async { Err::<(), _>(FetchError::Transient { status: 503 }) })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_skips_calls() {
        let breaker = CircuitBreaker::new("us", 3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let invoked = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&invoked);
        let result = breaker
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, FetchError>(())
            })
            .await;

        assert!(matches!(result, Err(FetchError::BreakerOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_trial_after_recovery() {
        let breaker = CircuitBreaker::new("uk", 1, Duration::from_millis(20));
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let trial = breaker.admit().unwrap();
        assert_eq!(trial.admission(), Admission::Trial);
        // Second concurrent caller is rejected while the trial is running
        assert!(matches!(
            breaker.admit(),
            Err(FetchError::BreakerOpen { .. })
        ));

        trial.succeed();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_trial_reopens() {
        let breaker = CircuitBreaker::new("uk", 1, Duration::from_millis(10));
        assert!(fail(&breaker).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(fail(&breaker).await.is_err());
        let inner_state = breaker.inner().state;
        assert_eq!(inner_state, BreakerState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("us", 3, Duration::from_secs(60));
        assert!(fail(&breaker).await.is_err());
        assert!(fail(&breaker).await.is_err());
        breaker.call(|| async { Ok::<_, FetchError>(()) }).await.unwrap();
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_client_errors_do_not_count() {
        let breaker = CircuitBreaker::new("us", 1, Duration::from_secs(60));
        let result = breaker
            .call(|| async { Err::<(), _>(FetchError::Client { status: 404 }) })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_trial_releases_slot() {
        let breaker = CircuitBreaker::new("uk", 1, Duration::from_millis(10));
        assert!(fail(&breaker).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // The trial never completes and its future is dropped by the timeout
        let stalled = tokio::time::timeout(
            Duration::from_millis(10),
            breaker.call(|| std::future::pending::<Result<(), FetchError>>()),
        )
        .await;
        assert!(stalled.is_err());

        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let next = breaker.admit().unwrap();
        assert_eq!(next.admission(), Admission::Trial);
        next.succeed();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_unsettled_normal_permit_is_neutral() {
        let breaker = CircuitBreaker::new("us", 1, Duration::from_secs(60));
        drop(breaker.admit().unwrap());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 0);

        breaker.admit().unwrap().fail();
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
