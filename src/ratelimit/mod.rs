//! Per-source request governance
//!
//! The [`RateGovernor`] protects slow external sources from being
//! overloaded. Before every outbound request it evaluates, in order:
//!
//! 1. the durable hourly window (shared by all worker processes),
//! 2. the in-process 60 second burst window,
//! 3. the minimum delay since the previous request to the same source,
//! 4. the respectful-hours multiplier applied to that minimum delay.
//!
//! The resulting wait is the **maximum** of all individual waits.
//!
//! The hourly window is booked through [`Persistence::upsert_rate_window`],
//! an atomic conditional increment, so concurrent workers never double-book
//! the budget. The burst window and the last-request clock are process-local
//! and therefore only a soft guard when several processes share a source.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::models::RateWindow;
use crate::storage::Persistence;
use crate::utils::error::FetchError;
use crate::utils::hour_start;

/// Length of the in-process burst window
const BURST_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of a rate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether a request may be issued right now
    pub allowed: bool,

    /// How long to wait before trying again (zero when allowed)
    pub wait: Duration,
}

impl RateDecision {
    fn from_wait(wait: Duration) -> Self {
        Self {
            allowed: wait.is_zero(),
            wait,
        }
    }

    /// Wait in fractional seconds
    pub fn wait_seconds(&self) -> f64 {
        self.wait.as_secs_f64()
    }
}

/// Process-local observations for one source
#[derive(Debug, Default)]
struct LocalState {
    /// Request timestamps within the burst window, oldest first
    recent: VecDeque<DateTime<Utc>>,
    last_request: Option<DateTime<Utc>>,
    requests_recorded: u64,
    total_response_ms: u64,
}

impl LocalState {
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - to_chrono(BURST_WINDOW);
        while self.recent.front().is_some_and(|t| *t <= horizon) {
            self.recent.pop_front();
        }
    }

    fn book(&mut self, now: DateTime<Utc>) {
        self.recent.push_back(now);
        self.last_request = Some(now);
    }
}

/// Usage counters observed by this process for one source
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SourceUsage {
    pub requests_recorded: u64,
    pub avg_response_ms: Option<f64>,
}

/// Enforces hourly quota, burst ceiling and pacing per source
pub struct RateGovernor {
    store: Arc<dyn Persistence>,
    limits: HashMap<String, SourceConfig>,
    fallback: SourceConfig,
    state: Mutex<HashMap<String, LocalState>>,
}

impl RateGovernor {
    /// Create a governor over the given per-source limits
    pub fn new(store: Arc<dyn Persistence>, limits: HashMap<String, SourceConfig>) -> Self {
        Self {
            store,
            limits,
            fallback: SourceConfig::default(),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Limits applied to a source; unknown sources get the defaults
    pub fn limits(&self, source: &str) -> &SourceConfig {
        self.limits.get(source).unwrap_or(&self.fallback)
    }

    fn state(&self) -> MutexGuard<'_, HashMap<String, LocalState>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check whether a request to `source` may be issued now
    ///
    /// This does not book anything; see [`RateGovernor::acquire`] and
    /// [`RateGovernor::record_request`].
    pub fn try_acquire(&self, source: &str) -> Result<RateDecision, FetchError> {
        self.try_acquire_at(source, Utc::now())
    }

    /// [`RateGovernor::try_acquire`] evaluated at an explicit instant
    pub fn try_acquire_at(
        &self,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, FetchError> {
        let mut state = self.state();
        let local = state.entry(source.to_string()).or_default();
        self.evaluate(source, local, now)
    }

    fn evaluate(
        &self,
        source: &str,
        local: &mut LocalState,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, FetchError> {
        let limits = self.limits(source);
        let window_start = hour_start(now);

        // (a) durable hourly window
        let window = self
            .store
            .rate_window(source, window_start)
            .map_err(|e| FetchError::Governor(e.to_string()))?;
        let hourly_exhausted = limits.rate_limit_per_hour == 0
            || window.is_some_and(|w| w.requests_made >= limits.rate_limit_per_hour);
        let hourly_wait = if hourly_exhausted {
            until(now, window_start + chrono::Duration::hours(1))
        } else {
            Duration::ZERO
        };

        // (b) burst window
        local.prune(now);
        let burst_wait = if local.recent.len() >= limits.burst_limit as usize {
            local
                .recent
                .front()
                .map(|oldest| until(now, *oldest + to_chrono(BURST_WINDOW)))
                .unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };

        // (c) + (d) pacing, stretched during respectful hours
        let delay = self.effective_min_delay(limits, now);
        let pacing_wait = local
            .last_request
            .map(|last| until(now, last + to_chrono(delay)))
            .unwrap_or(Duration::ZERO);

        let wait = hourly_wait.max(burst_wait).max(pacing_wait);
        if !wait.is_zero() {
            debug!(
                source,
                hourly_ms = hourly_wait.as_millis() as u64,
                burst_ms = burst_wait.as_millis() as u64,
                pacing_ms = pacing_wait.as_millis() as u64,
                "Rate governor requests a wait"
            );
        }

        Ok(RateDecision::from_wait(wait))
    }

    /// Minimum inter-request delay in force for `limits` at `now`
    pub fn effective_min_delay(&self, limits: &SourceConfig, now: DateTime<Utc>) -> Duration {
        let base = limits.min_delay();
        match &limits.respectful_hours {
            Some(hours) => {
                let local_hour =
                    (now + chrono::Duration::hours(i64::from(hours.utc_offset_hours))).hour();
                if hours.contains(local_hour) {
                    base.mul_f64(hours.multiplier.max(1.0))
                } else {
                    base
                }
            }
            None => base,
        }
    }

    /// Check and, if allowed, book a request slot atomically
    ///
    /// Returns the decision; on `allowed` the durable window and local
    /// clocks have already been updated.
    pub fn try_reserve_at(
        &self,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, FetchError> {
        let mut state = self.state();
        let local = state.entry(source.to_string()).or_default();

        let decision = self.evaluate(source, local, now)?;
        if !decision.allowed {
            return Ok(decision);
        }

        let window_start = hour_start(now);
        let booked = self
            .store
            .upsert_rate_window(source, window_start, self.limits(source).rate_limit_per_hour)
            .map_err(|e| FetchError::Governor(e.to_string()))?;

        if !booked {
            // Another process took the last slot between our check and booking
            let wait = until(now, window_start + chrono::Duration::hours(1));
            return Ok(RateDecision::from_wait(wait));
        }

        local.book(now);
        Ok(decision)
    }

    /// Wait until a request slot for `source` is available and book it
    ///
    /// This is the single blocking point of an outbound call. Returns the
    /// total time spent waiting.
    pub async fn acquire(&self, source: &str) -> Result<Duration, FetchError> {
        let mut waited = Duration::ZERO;
        loop {
            let decision = self.try_reserve_at(source, Utc::now())?;
            if decision.allowed {
                if !waited.is_zero() {
                    debug!(source, waited_ms = waited.as_millis() as u64, "Rate slot acquired");
                }
                return Ok(waited);
            }
            tokio::time::sleep(decision.wait).await;
            waited += decision.wait;
        }
    }

    /// Record a request issued without going through [`RateGovernor::acquire`]
    ///
    /// The request counts against the hourly window and burst window. If
    /// the window was already full the request is still noted locally and a
    /// warning is logged.
    pub fn record_request(&self, source: &str, response_time_ms: u64) -> Result<(), FetchError> {
        let now = Utc::now();
        let booked = self
            .store
            .upsert_rate_window(
                source,
                hour_start(now),
                self.limits(source).rate_limit_per_hour,
            )
            .map_err(|e| FetchError::Governor(e.to_string()))?;
        if !booked {
            warn!(source, "Request recorded beyond the hourly allowance");
        }

        let mut state = self.state();
        let local = state.entry(source.to_string()).or_default();
        local.prune(now);
        local.book(now);
        local.requests_recorded += 1;
        local.total_response_ms += response_time_ms;
        Ok(())
    }

    /// Note the latency of a request booked through [`RateGovernor::acquire`]
    pub fn observe_latency(&self, source: &str, response_time_ms: u64) {
        let mut state = self.state();
        let local = state.entry(source.to_string()).or_default();
        local.requests_recorded += 1;
        local.total_response_ms += response_time_ms;
    }

    /// Usage observed by this process
    pub fn usage(&self, source: &str) -> SourceUsage {
        let state = self.state();
        match state.get(source) {
            Some(local) if local.requests_recorded > 0 => SourceUsage {
                requests_recorded: local.requests_recorded,
                avg_response_ms: Some(
                    local.total_response_ms as f64 / local.requests_recorded as f64,
                ),
            },
            Some(local) => SourceUsage {
                requests_recorded: local.requests_recorded,
                avg_response_ms: None,
            },
            None => SourceUsage::default(),
        }
    }

    /// Durable window for the current hour
    pub fn current_window(&self, source: &str) -> Result<Option<RateWindow>, FetchError> {
        self.store
            .rate_window(source, hour_start(Utc::now()))
            .map_err(|e| FetchError::Governor(e.to_string()))
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Non-negative time from `now` until `at`
fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RespectfulHours;
    use crate::storage::SqliteStore;
    use chrono::TimeZone;

    fn governor(config: SourceConfig) -> RateGovernor {
        let store: Arc<dyn Persistence> = Arc::new(SqliteStore::in_memory().unwrap());
        let mut limits = HashMap::new();
        limits.insert("us".to_string(), config);
        RateGovernor::new(store, limits)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, s).unwrap()
    }

    #[test]
    fn test_hourly_quota_blocks_until_rollover() {
        let gov = governor(SourceConfig {
            rate_limit_per_hour: 60,
            burst_limit: 1000,
            min_delay_seconds: 0.0,
            ..Default::default()
        });

        for i in 0..60 {
            let now = at(10, 0, i);
            assert!(gov.try_reserve_at("us", now).unwrap().allowed);
        }

        let blocked = gov.try_acquire_at("us", at(10, 1, 0)).unwrap();
        assert!(!blocked.allowed);
        assert_eq!(blocked.wait, Duration::from_secs(59 * 60));

        // New window
        assert!(gov.try_acquire_at("us", at(11, 0, 0)).unwrap().allowed);
    }

    #[test]
    fn test_burst_window() {
        let gov = governor(SourceConfig {
            rate_limit_per_hour: 1000,
            burst_limit: 3,
            min_delay_seconds: 0.0,
            ..Default::default()
        });

        for s in 0..3 {
            assert!(gov.try_reserve_at("us", at(9, 0, s)).unwrap().allowed);
        }
        let decision = gov.try_acquire_at("us", at(9, 0, 10)).unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.wait, Duration::from_secs(50));

        assert!(gov.try_acquire_at("us", at(9, 1, 0)).unwrap().allowed);
    }

    #[test]
    fn test_min_delay() {
        let gov = governor(SourceConfig {
            min_delay_seconds: 5.0,
            ..Default::default()
        });

        assert!(gov.try_reserve_at("us", at(9, 0, 0)).unwrap().allowed);
        let decision = gov.try_acquire_at("us", at(9, 0, 2)).unwrap();
        assert_eq!(decision.wait, Duration::from_secs(3));
    }

    #[test]
    fn test_respectful_hours_take_maximum() {
        let gov = governor(SourceConfig {
            min_delay_seconds: 2.0,
            burst_limit: 1,
            respectful_hours: Some(RespectfulHours {
                start_hour: 9,
                end_hour: 17,
                utc_offset_hours: -5,
                multiplier: 3.0,
            }),
            ..Default::default()
        });

        // 15:00 UTC is 10:00 source-local: pacing is 6s, burst wait is 60s
        assert!(gov.try_reserve_at("us", at(15, 0, 0)).unwrap().allowed);
        let decision = gov.try_acquire_at("us", at(15, 0, 1)).unwrap();
        assert_eq!(decision.wait, Duration::from_secs(59));

        let limits = gov.limits("us").clone();
        assert_eq!(
            gov.effective_min_delay(&limits, at(15, 0, 0)),
            Duration::from_secs(6)
        );
        assert_eq!(
            gov.effective_min_delay(&limits, at(3, 0, 0)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_record_request_counts_against_window() {
        let gov = governor(SourceConfig {
            rate_limit_per_hour: 2,
            min_delay_seconds: 0.0,
            ..Default::default()
        });

        gov.record_request("us", 100).unwrap();
        gov.record_request("us", 300).unwrap();

        assert!(!gov.try_acquire("us").unwrap().allowed);
        let usage = gov.usage("us");
        assert_eq!(usage.requests_recorded, 2);
        assert_eq!(usage.avg_response_ms, Some(200.0));
        assert_eq!(gov.current_window("us").unwrap().unwrap().requests_made, 2);
    }

    #[test]
    fn test_unknown_source_uses_defaults() {
        let gov = governor(SourceConfig::default());
        assert!(gov.try_acquire("elsewhere").unwrap().allowed);
        assert_eq!(gov.limits("elsewhere").rate_limit_per_hour, 60);
    }

    #[tokio::test]
    async fn test_acquire_books_slot() {
        let gov = governor(SourceConfig {
            min_delay_seconds: 0.0,
            ..Default::default()
        });
        let waited = gov.acquire("us").await.unwrap();
        assert_eq!(waited, Duration::ZERO);
        assert_eq!(gov.current_window("us").unwrap().unwrap().requests_made, 1);
    }
}
