//! Source health snapshot and operator alerts
//!
//! The snapshot combines live client counters (requests, errors, cache,
//! breaker state) with the most recent job rollup of each source. Alerts
//! raised from it are delivered through a [`Notifier`]; how a notifier
//! reaches a human is up to its implementation.
//!
//! ```text
//! CachedHttpClient stats ─┐
//!                         ├─▶ HealthMonitor::snapshot() ─▶ HealthSnapshot
//! MetricsWindow rollups ──┘            │
//!                                      └─▶ dispatch_alerts() ─▶ Notifier
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::breaker::BreakerState;
use crate::metrics::MetricsAggregator;
use crate::models::{HealthStatus, MetricsWindow};
use crate::sources::RegisteredSource;

/// Rollup rows scanned when looking for each source's latest window
const ROLLUP_SCAN: usize = 500;

/// Severity level of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition an alert reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    BreakerOpen,
    AuthFailure,
    Degraded,
    Unhealthy,
}

impl AlertKind {
    fn severity(&self) -> Severity {
        match self {
            Self::Degraded => Severity::Warning,
            Self::BreakerOpen | Self::AuthFailure | Self::Unhealthy => Severity::Critical,
        }
    }
}

/// An active alert for one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub source: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    fn new(kind: AlertKind, source: &str, title: String, message: String) -> Self {
        Self {
            kind,
            source: source.to_string(),
            severity: kind.severity(),
            title,
            message,
            raised_at: Utc::now(),
        }
    }
}

/// Delivery capability for operator notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns whether the message was delivered
    async fn notify(&self, user_id: &str, title: &str, message: &str, severity: Severity) -> bool;
}

/// Notifier that writes alerts to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, user_id: &str, title: &str, message: &str, severity: Severity) -> bool {
        match severity {
            Severity::Critical => error!(user_id, %severity, title, message, "Alert"),
            Severity::Warning => warn!(user_id, %severity, title, message, "Alert"),
            Severity::Info => info!(user_id, %severity, title, message, "Alert"),
        }
        true
    }
}

/// Health of one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHealth {
    pub total_requests: u64,
    pub error_rate: f64,
    pub avg_response_ms: f64,
    pub cache_hit_rate: f64,
    /// `None` for adapters without a governed client
    pub circuit_state: Option<BreakerState>,
    pub auth_failures: u64,
    pub status: HealthStatus,
    /// Job success rate from the latest rollup, if any
    pub job_success_rate: Option<f64>,
}

/// Point-in-time health of every registered source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub per_source: BTreeMap<String, SourceHealth>,
    pub active_alerts: Vec<Alert>,
    pub generated_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Worst status across sources; healthy when there are none
    pub fn overall(&self) -> HealthStatus {
        let statuses: Vec<_> = self.per_source.values().map(|h| h.status).collect();
        if statuses.contains(&HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if statuses.contains(&HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Builds health snapshots and forwards new alerts to a notifier
pub struct HealthMonitor {
    sources: BTreeMap<String, RegisteredSource>,
    rollups: Option<MetricsAggregator>,
    notifier: Arc<dyn Notifier>,
    operator: String,
    /// (source, kind) pairs already notified and still active
    notified: Mutex<HashSet<(String, AlertKind)>>,
}

impl HealthMonitor {
    pub fn new(sources: BTreeMap<String, RegisteredSource>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            sources,
            rollups: None,
            notifier,
            operator: "operators".to_string(),
            notified: Mutex::new(HashSet::new()),
        }
    }

    /// Classify sources from job rollups when available
    pub fn with_rollups(mut self, rollups: MetricsAggregator) -> Self {
        self.rollups = Some(rollups);
        self
    }

    /// Recipient passed to the notifier
    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = operator.into();
        self
    }

    /// Current health of every registered source
    pub fn snapshot(&self) -> HealthSnapshot {
        let latest = match &self.rollups {
            Some(rollups) => rollups.latest_by_source(ROLLUP_SCAN).unwrap_or_else(|e| {
                warn!(error = %e, "Failed to read metrics rollups");
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };

        let mut per_source = BTreeMap::new();
        let mut active_alerts = Vec::new();
        for (name, source) in &self.sources {
            let health = source_health(source, latest.get(name));
            active_alerts.extend(alerts_for(name, &health));
            per_source.insert(name.clone(), health);
        }

        HealthSnapshot {
            per_source,
            active_alerts,
            generated_at: Utc::now(),
        }
    }

    /// Notify alerts that became active since the last dispatch
    ///
    /// Returns how many notifications were delivered. Alerts that are no
    /// longer active are forgotten, so they notify again if they return.
    pub async fn dispatch_alerts(&self, snapshot: &HealthSnapshot) -> usize {
        let fresh: Vec<&Alert> = {
            let mut notified = self.notified.lock().unwrap_or_else(|e| e.into_inner());
            let active: HashSet<(String, AlertKind)> = snapshot
                .active_alerts
                .iter()
                .map(|a| (a.source.clone(), a.kind))
                .collect();
            notified.retain(|key| active.contains(key));
            snapshot
                .active_alerts
                .iter()
                .filter(|a| notified.insert((a.source.clone(), a.kind)))
                .collect()
        };

        let mut delivered = 0;
        for alert in fresh {
            if self
                .notifier
                .notify(&self.operator, &alert.title, &alert.message, alert.severity)
                .await
            {
                delivered += 1;
            } else {
                warn!(source = %alert.source, kind = ?alert.kind, "Alert delivery failed");
                self.notified
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&(alert.source.clone(), alert.kind));
            }
        }
        delivered
    }
}

fn source_health(source: &RegisteredSource, rollup: Option<&MetricsWindow>) -> SourceHealth {
    let stats = source.adapter.client().map(|c| c.stats()).unwrap_or_default();
    let circuit_state = source.adapter.client().map(|c| c.breaker_state());

    let status = match rollup {
        Some(window) => window.health,
        None if stats.total_requests > 0 => {
            HealthStatus::from_success_rate(1.0 - stats.error_rate())
        }
        None => HealthStatus::Healthy,
    };

    SourceHealth {
        total_requests: stats.total_requests,
        error_rate: stats.error_rate(),
        avg_response_ms: stats.avg_response_ms(),
        cache_hit_rate: stats.cache_hit_rate(),
        circuit_state,
        auth_failures: stats.auth_failures,
        status,
        job_success_rate: rollup.map(|w| w.success_rate),
    }
}

fn alerts_for(source: &str, health: &SourceHealth) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if health.circuit_state == Some(BreakerState::Open) {
        alerts.push(Alert::new(
            AlertKind::BreakerOpen,
            source,
            format!("Circuit open for {source}"),
            format!(
                "Requests to {source} are being rejected after repeated failures (error rate {:.0}%)",
                health.error_rate * 100.0
            ),
        ));
    }
    if health.auth_failures > 0 {
        alerts.push(Alert::new(
            AlertKind::AuthFailure,
            source,
            format!("Credentials rejected by {source}"),
            format!(
                "{source} rejected {} request(s) as unauthorized; check the API key",
                health.auth_failures
            ),
        ));
    }
    match health.status {
        HealthStatus::Unhealthy => alerts.push(Alert::new(
            AlertKind::Unhealthy,
            source,
            format!("{source} is unhealthy"),
            status_message(source, health),
        )),
        HealthStatus::Degraded => alerts.push(Alert::new(
            AlertKind::Degraded,
            source,
            format!("{source} is degraded"),
            status_message(source, health),
        )),
        HealthStatus::Healthy => {}
    }

    alerts
}

fn status_message(source: &str, health: &SourceHealth) -> String {
    match health.job_success_rate {
        Some(rate) => format!("{source} job success rate is {:.0}%", rate * 100.0),
        None => format!("{source} request error rate is {:.0}%", health.error_rate * 100.0),
    }
}
