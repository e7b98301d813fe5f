//! Dead-letter recovery
//!
//! Jobs that exhausted their retries get a second chance on a slower
//! cadence: a dead-letter record is turned back into a brand-new job as
//! long as the unit of work has used fewer than `max_total_attempts`
//! attempts across all its incarnations. Past that ceiling the record is
//! flagged for manual review instead.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{JobError, JobResult};
use super::scheduler::Scheduler;
use crate::config::DeadLetterConfig;
use crate::health::{Notifier, Severity};
use crate::metrics;
use crate::models::{DeadLetterRecord, JobRecord, Priority};
use crate::storage::Persistence;

/// What one batch did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub examined: usize,
    pub requeued: usize,
    pub manual: usize,
    /// Records another worker handled first
    pub skipped: usize,
}

/// Requeues or quarantines dead-lettered jobs
pub struct DeadLetterManager {
    scheduler: Arc<Scheduler>,
    max_total_attempts: u32,
    batch_size: usize,
    notifier: Option<Arc<dyn Notifier>>,
    operator: String,
}

impl DeadLetterManager {
    pub fn new(scheduler: Arc<Scheduler>, config: &DeadLetterConfig) -> Self {
        Self {
            scheduler,
            max_total_attempts: config.max_total_attempts,
            batch_size: config.batch_size.max(1),
            notifier: None,
            operator: "operators".to_string(),
        }
    }

    /// Notify operators when a record needs manual review
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>, operator: impl Into<String>) -> Self {
        self.notifier = Some(notifier);
        self.operator = operator.into();
        self
    }

    fn store(&self) -> &Arc<dyn Persistence> {
        self.scheduler.store()
    }

    /// Process up to the configured batch size
    pub async fn process_next_batch(&self) -> JobResult<BatchReport> {
        self.process_batch(self.batch_size).await
    }

    /// Examine up to `limit` unprocessed records not awaiting review
    pub async fn process_batch(&self, limit: usize) -> JobResult<BatchReport> {
        let records = self.store().unprocessed_dead_letters(limit)?;
        let mut report = BatchReport {
            examined: records.len(),
            ..BatchReport::default()
        };

        for record in records {
            if record.total_retry_attempts < self.max_total_attempts {
                match self.requeue(&record, false)? {
                    Some(job) => {
                        info!(
                            job_id = %job.id,
                            requeued_from = ?job.requeued_from,
                            previous_attempts = job.previous_attempts,
                            "Dead-lettered job requeued"
                        );
                        report.requeued += 1;
                    }
                    None => report.skipped += 1,
                }
            } else if self.flag_manual(&record).await? {
                report.manual += 1;
            } else {
                report.skipped += 1;
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                requeued = report.requeued,
                manual = report.manual,
                skipped = report.skipped,
                "Dead-letter batch processed"
            );
        }
        Ok(report)
    }

    /// Requeue a record as a brand-new PENDING job
    ///
    /// The new job inherits the record's attempts as `previous_attempts`,
    /// so the ceiling bounds the total work spent on the unit. Returns `None`
    /// when the record was claimed elsewhere; nothing is enqueued then.
    fn requeue(&self, record: &DeadLetterRecord, force: bool) -> JobResult<Option<JobRecord>> {
        let priority = self
            .store()
            .get_job(record.original_job_id)?
            .map(|original| original.priority)
            .unwrap_or(Priority::Normal);
        let max_retries = self.scheduler.max_retries_for(&record.original_args);

        let mut job = JobRecord::new(record.original_args.clone(), priority, max_retries);
        job.previous_attempts = record.total_retry_attempts;
        job.requeued_from = Some(record.original_job_id);

        if !self.store().requeue_dead_letter(record.id, &job, force)? {
            debug!(dead_letter_id = %record.id, "Dead-letter record already claimed");
            return Ok(None);
        }
        self.scheduler.queue().push(job.id, job.priority);
        metrics::record_dead_letter_decision(record.task_kind.as_str(), true);
        Ok(Some(job))
    }

    /// Returns `false` when the record was already handled elsewhere
    async fn flag_manual(&self, record: &DeadLetterRecord) -> JobResult<bool> {
        if !self.store().flag_dead_letter_manual(record.id)? {
            debug!(dead_letter_id = %record.id, "Dead-letter record already claimed");
            return Ok(false);
        }
        metrics::record_dead_letter_decision(record.task_kind.as_str(), false);
        error!(
            dead_letter_id = %record.id,
            job_id = %record.original_job_id,
            kind = %record.task_kind,
            total_attempts = record.total_retry_attempts,
            reason = %record.failure_reason,
            "Dead-lettered job needs manual intervention"
        );

        if let Some(notifier) = &self.notifier {
            let title = format!("Manual intervention required: {}", record.task_kind);
            let message = format!(
                "Job {} ({}) failed {} times: {}",
                record.original_job_id,
                record.original_args.source(),
                record.total_retry_attempts,
                record.failure_reason
            );
            if !notifier
                .notify(&self.operator, &title, &message, Severity::Critical)
                .await
            {
                warn!(dead_letter_id = %record.id, "Manual intervention notice not delivered");
            }
        }
        Ok(true)
    }

    /// Operator override: requeue a record regardless of the ceiling
    pub fn force_requeue(&self, dead_letter_id: Uuid) -> JobResult<Uuid> {
        let record = self
            .store()
            .get_dead_letter(dead_letter_id)?
            .ok_or(JobError::DeadLetterNotFound(dead_letter_id))?;
        if let Some(job_id) = record.requeued_job_id {
            return Ok(job_id);
        }

        match self.requeue(&record, true)? {
            Some(job) => {
                info!(dead_letter_id = %dead_letter_id, job_id = %job.id, "Dead-letter record force-requeued");
                Ok(job.id)
            }
            // Lost the race: report the job the winner created
            None => self
                .store()
                .get_dead_letter(dead_letter_id)?
                .and_then(|winner| winner.requeued_job_id)
                .ok_or(JobError::DeadLetterNotFound(dead_letter_id)),
        }
    }

    /// Operator override: close a record without running it again
    ///
    /// Resolving an already processed record leaves it unchanged.
    pub fn resolve(&self, dead_letter_id: Uuid) -> JobResult<DeadLetterRecord> {
        if self.store().resolve_dead_letter(dead_letter_id)? {
            info!(dead_letter_id = %dead_letter_id, "Dead-letter record resolved");
        }
        self.store()
            .get_dead_letter(dead_letter_id)?
            .ok_or(JobError::DeadLetterNotFound(dead_letter_id))
    }

    /// Process a batch every `interval` until the queue is closed
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.scheduler.queue().is_closed() {
                break;
            }
            if let Err(e) = self.process_next_batch().await {
                if e.is_recoverable() {
                    warn!(error = %e, "Dead-letter batch interrupted");
                } else {
                    error!(error = %e, "Dead-letter batch failed");
                }
            }
        }
    }
}
