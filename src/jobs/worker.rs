//! Job execution loop
//!
//! A [`Worker`] is the only writer of job status after creation. Every
//! status change is a compare-and-set against the status the worker last
//! saw, so two workers can never both run or both finish the same job.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{JobError, JobResult};
use super::registry::TaskRegistry;
use super::scheduler::Scheduler;
use super::{decide, TaskOutcome, Transition};
use crate::config::JobConfig;
use crate::metrics;
use crate::models::{DeadLetterRecord, JobRecord, JobStatus};
use crate::storage::Persistence;
use crate::utils::retry::RetryConfig;

/// Slack between the queue's clock and a retry's `scheduled_at`
const RETRY_EARLY_TOLERANCE_SECS: i64 = 1;

/// What a recovery pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// PENDING jobs queued again
    pub pending: usize,
    /// RETRY jobs queued again at their scheduled time
    pub retries: usize,
    /// STARTED jobs whose worker was lost
    pub orphaned: usize,
    /// FAILURE jobs moved on to DEAD_LETTER
    pub dead_lettered: usize,
}

/// Runs queued jobs and persists their transitions
pub struct Worker {
    scheduler: Arc<Scheduler>,
    registry: Arc<TaskRegistry>,
    backoff: RetryConfig,
    orphan_timeout: Duration,
}

impl Worker {
    pub fn new(scheduler: Arc<Scheduler>, registry: Arc<TaskRegistry>) -> Self {
        let config = scheduler.config().clone();
        Self {
            scheduler,
            registry,
            backoff: backoff_for(&config),
            orphan_timeout: Duration::from_secs(config.orphan_timeout_secs),
        }
    }

    /// Override the task-level backoff
    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    fn store(&self) -> &Arc<dyn Persistence> {
        self.scheduler.store()
    }

    /// Run one job to its next resting status
    ///
    /// Returns `None` when the job is not runnable (stale queue entry, or
    /// another worker claimed it first).
    pub async fn run_job(&self, job_id: Uuid) -> JobResult<Option<JobStatus>> {
        let mut job = self
            .store()
            .get_job(job_id)?
            .ok_or(JobError::NotFound(job_id))?;

        let claimed_from = job.status;
        if !claimed_from.can_transition_to(JobStatus::Started) {
            debug!(job_id = %job.id, status = %job.status, "Skipping job that is not runnable");
            return Ok(None);
        }

        // Duplicate entry for a retry that is still backing off
        if claimed_from == JobStatus::Retry
            && job.scheduled_at > Utc::now() + chrono::Duration::seconds(RETRY_EARLY_TOLERANCE_SECS)
        {
            debug!(job_id = %job.id, scheduled_at = %job.scheduled_at, "Retry not yet due");
            return Ok(None);
        }

        let started = Utc::now();
        job.status = JobStatus::Started;
        job.started_at = Some(started);
        if !self.store().update_job_status(&job, claimed_from)? {
            debug!(job_id = %job.id, "Job claimed by another worker");
            return Ok(None);
        }

        let kind = job.kind();
        info!(
            job_id = %job.id,
            kind = %kind,
            source = %job.source(),
            attempt = job.retry_count + 1,
            max_retries = job.max_retries,
            "Job started"
        );

        let outcome = {
            let _timer = metrics::start_job_timer(kind.as_str());
            match self.registry.get(kind) {
                Some(handler) => handler.run(&job.args).await,
                None => TaskOutcome::permanent(JobError::NoHandler(kind).to_string()),
            }
        };

        let transition = decide(&job, &outcome, &self.backoff);
        let error = match outcome {
            TaskOutcome::Failed { error, .. } => Some(error),
            TaskOutcome::Success { .. } => None,
        };
        self.apply(job, transition, error).map(Some)
    }

    /// Persist `transition` for a STARTED job
    fn apply(
        &self,
        mut job: JobRecord,
        transition: Transition,
        error: Option<String>,
    ) -> JobResult<JobStatus> {
        let now = Utc::now();
        let duration_ms = job
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64);
        let kind = job.kind();

        match transition {
            Transition::Succeed => {
                job.status = JobStatus::Success;
                job.completed_at = Some(now);
                job.duration_ms = duration_ms;
                job.error_message = None;
                self.compare_and_set(&job, JobStatus::Started)?;

                metrics::record_job_outcome(kind.as_str(), JobStatus::Success.as_str());
                info!(job_id = %job.id, duration_ms, "Job succeeded");
            }
            Transition::Retry { retry_count, delay } => {
                job.status = JobStatus::Retry;
                job.retry_count = retry_count;
                job.scheduled_at =
                    now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                job.duration_ms = duration_ms;
                job.error_message = error;
                self.compare_and_set(&job, JobStatus::Started)?;
                self.scheduler.schedule_retry(&job, delay);

                metrics::record_job_outcome(kind.as_str(), JobStatus::Retry.as_str());
                metrics::record_job_retry(job.source());
                warn!(
                    job_id = %job.id,
                    retry_count,
                    delay_secs = delay.as_secs(),
                    error = job.error_message.as_deref().unwrap_or(""),
                    "Job failed, retry scheduled"
                );
            }
            Transition::DeadLetter {
                retry_count,
                reason,
            } => {
                job.status = JobStatus::Failure;
                job.retry_count = retry_count;
                job.completed_at = Some(now);
                job.duration_ms = duration_ms;
                job.error_message = Some(reason.clone());
                self.compare_and_set(&job, JobStatus::Started)?;
                metrics::record_job_outcome(kind.as_str(), JobStatus::Failure.as_str());

                self.dead_letter(&mut job, &reason)?;
            }
        }

        Ok(job.status)
    }

    /// FAILURE -> DEAD_LETTER, writing the dead-letter record atomically
    fn dead_letter(&self, job: &mut JobRecord, reason: &str) -> JobResult<()> {
        check_transition(job.id, job.status, JobStatus::DeadLetter)?;
        let record = DeadLetterRecord::from_job(job, reason);
        job.status = JobStatus::DeadLetter;
        if !self.store().create_dead_letter_record(job, &record)? {
            return Err(JobError::Conflict {
                job_id: job.id,
                expected: JobStatus::Failure,
            });
        }

        metrics::record_dead_letter(job.kind().as_str());
        error!(
            job_id = %job.id,
            dead_letter_id = %record.id,
            kind = %job.kind(),
            total_attempts = record.total_retry_attempts,
            reason,
            "Job dead-lettered"
        );
        Ok(())
    }

    /// Persist `job` if its stored status is still `expected`
    fn compare_and_set(&self, job: &JobRecord, expected: JobStatus) -> JobResult<()> {
        check_transition(job.id, expected, job.status)?;
        if self.store().update_job_status(job, expected)? {
            Ok(())
        } else {
            Err(JobError::Conflict {
                job_id: job.id,
                expected,
            })
        }
    }

    /// Rebuild in-process state from the store after a restart
    ///
    /// Nothing is left stranded: queued work is queued again, jobs whose
    /// worker died count the lost run as a failed attempt, and FAILURE jobs
    /// are dead-lettered.
    pub async fn recover(&self) -> JobResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for job in self.store().jobs_by_status(JobStatus::Pending)? {
            if self.scheduler.requeue_existing(&job) {
                report.pending += 1;
            }
        }
        for job in self.store().jobs_by_status(JobStatus::Retry)? {
            if self.scheduler.requeue_existing(&job) {
                report.retries += 1;
            }
        }

        let orphan_timeout =
            chrono::Duration::from_std(self.orphan_timeout).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - orphan_timeout;
        for job in self.store().jobs_by_status(JobStatus::Started)? {
            let started_at = job.started_at.unwrap_or(job.scheduled_at);
            if started_at > cutoff {
                continue;
            }
            warn!(job_id = %job.id, %started_at, "Recovering orphaned job");
            let lost = "worker lost before the job completed";
            let transition = decide(&job, &TaskOutcome::transient(lost), &self.backoff);
            match self.apply(job, transition, Some(lost.to_string())) {
                Ok(_) => report.orphaned += 1,
                Err(JobError::Conflict { job_id, .. }) => {
                    debug!(%job_id, "Orphaned job finished concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        for mut job in self.store().jobs_by_status(JobStatus::Failure)? {
            let reason = job
                .error_message
                .clone()
                .unwrap_or_else(|| "failed before dead-lettering".to_string());
            match self.dead_letter(&mut job, &reason) {
                Ok(()) => report.dead_lettered += 1,
                Err(JobError::Conflict { job_id, .. }) => {
                    debug!(%job_id, "Failed job dead-lettered concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            pending = report.pending,
            retries = report.retries,
            orphaned = report.orphaned,
            dead_lettered = report.dead_lettered,
            "Job recovery complete"
        );
        Ok(report)
    }

    /// Queue PENDING jobs created by other processes
    ///
    /// Jobs already queued here get a second entry, which is skipped once
    /// the first one has claimed the job.
    pub fn poll_pending(&self) -> JobResult<usize> {
        let pending = self.store().jobs_by_status(JobStatus::Pending)?;
        let count = pending
            .iter()
            .filter(|job| self.scheduler.requeue_existing(job))
            .count();
        if count > 0 {
            debug!(count, "Queued pending jobs from store");
        }
        Ok(count)
    }

    /// Run `workers` concurrent loops until the queue is closed
    pub async fn run(self: Arc<Self>, workers: usize) {
        let loops = (0..workers.max(1)).map(|worker_id| {
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                debug!(worker_id, "Worker loop started");
                while let Some(job_id) = worker.scheduler.queue().pop().await {
                    worker.run_logged(job_id).await;
                }
                debug!(worker_id, "Worker loop stopped");
            })
        });

        for joined in join_all(loops).await {
            if let Err(e) = joined {
                error!(error = %e, "Worker loop panicked");
            }
        }
    }

    /// Run queued jobs, including delayed retries, until nothing is left
    ///
    /// Returns how many queue entries were processed.
    pub async fn run_until_empty(&self) -> usize {
        let mut processed = 0;
        while let Some(job_id) = self.scheduler.queue().pop_draining().await {
            self.run_logged(job_id).await;
            processed += 1;
        }
        processed
    }

    async fn run_logged(&self, job_id: Uuid) {
        if let Err(e) = self.run_job(job_id).await {
            if e.is_recoverable() {
                warn!(%job_id, error = %e, "Job run interrupted");
            } else {
                error!(%job_id, error = %e, "Job run failed");
            }
        }
    }
}

/// Task-level backoff: `retry_base_delay_secs * 2^retry_count`, capped
fn check_transition(job_id: Uuid, from: JobStatus, to: JobStatus) -> JobResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(JobError::InvalidTransition { job_id, from, to })
    }
}

fn backoff_for(config: &JobConfig) -> RetryConfig {
    RetryConfig::with_delays(
        u32::MAX,
        config.retry_base_delay_secs.saturating_mul(1000),
        config.retry_max_delay_secs.saturating_mul(1000),
    )
}
