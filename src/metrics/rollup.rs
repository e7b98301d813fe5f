//! Time-windowed health statistics rolled up from persisted job records

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use statrs::statistics::{Data, OrderStatistics};

use crate::models::{HealthStatus, JobRecord, JobStatus, MetricsWindow};
use crate::storage::{Persistence, StorageResult};

/// Rolls completed jobs up into per-source [`MetricsWindow`]s
pub struct MetricsAggregator {
    store: Arc<dyn Persistence>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Summarize jobs completed in `[period_start, period_end)` and persist
    /// one window per source
    ///
    /// Sources without completed jobs in the period produce no window.
    pub fn rollup(
        &self,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> StorageResult<Vec<MetricsWindow>> {
        let jobs = self.store.jobs_completed_between(period_start, period_end)?;

        let mut by_source: BTreeMap<&str, Vec<&JobRecord>> = BTreeMap::new();
        for job in &jobs {
            by_source.entry(job.source()).or_default().push(job);
        }

        let mut windows = Vec::with_capacity(by_source.len());
        for (source, jobs) in by_source {
            let window = summarize(source, period_start, period_end, &jobs);
            self.store.append_metrics_window(&window)?;

            tracing::info!(
                source,
                total = window.total_jobs,
                success_rate = window.success_rate,
                health = window.health.as_str(),
                "Metrics window rolled up"
            );
            windows.push(window);
        }

        Ok(windows)
    }

    /// Roll up the period ending now
    pub fn rollup_last(&self, period: chrono::Duration) -> StorageResult<Vec<MetricsWindow>> {
        let end = Utc::now();
        self.rollup(end - period, end)
    }

    /// Most recent window per source
    pub fn latest_by_source(&self, scan: usize) -> StorageResult<BTreeMap<String, MetricsWindow>> {
        let mut latest = BTreeMap::new();
        for window in self.store.recent_metrics_windows(scan)? {
            latest.entry(window.source.clone()).or_insert(window);
        }
        Ok(latest)
    }
}

fn summarize(
    source: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    jobs: &[&JobRecord],
) -> MetricsWindow {
    let total = jobs.len() as u32;
    let (mut successful, mut failed, mut dead_letter, mut retried) = (0u32, 0u32, 0u32, 0u32);
    for job in jobs {
        match job.status {
            JobStatus::Success => successful += 1,
            JobStatus::DeadLetter => {
                failed += 1;
                dead_letter += 1;
            }
            JobStatus::Failure => failed += 1,
            _ => {}
        }
        if job.retry_count > 0 {
            retried += 1;
        }
    }

    let durations: Vec<u64> = jobs.iter().filter_map(|j| j.duration_ms).collect();
    let (avg, min, max, p50, p95) = if durations.is_empty() {
        (None, None, None, None, None)
    } else {
        let sum: u64 = durations.iter().sum();
        let avg = sum as f64 / durations.len() as f64;
        let mut data = Data::new(durations.iter().map(|d| *d as f64).collect::<Vec<_>>());
        (
            Some(avg),
            durations.iter().min().copied(),
            durations.iter().max().copied(),
            Some(data.percentile(50)),
            Some(data.percentile(95)),
        )
    };

    let success_rate = if total == 0 {
        0.0
    } else {
        f64::from(successful) / f64::from(total)
    };

    MetricsWindow {
        period_start,
        period_end,
        source: source.to_string(),
        total_jobs: total,
        successful_jobs: successful,
        failed_jobs: failed,
        retried_jobs: retried,
        dead_letter_jobs: dead_letter,
        avg_duration_ms: avg,
        min_duration_ms: min,
        max_duration_ms: max,
        p50_duration_ms: p50,
        p95_duration_ms: p95,
        success_rate,
        health: HealthStatus::from_success_rate(success_rate),
    }
}
