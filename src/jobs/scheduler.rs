//! Job creation and the in-process run queue
//!
//! Jobs are persisted first and queued second, so a crash between the two
//! leaves a PENDING row that recovery picks up again.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::error::{JobError, JobResult};
use crate::config::{Config, JobConfig};
use crate::metrics;
use crate::models::{JobRecord, JobStatus, Priority, TaskArgs};
use crate::storage::Persistence;

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: u8,
    seq: u64,
    job_id: Uuid,
}

impl Ord for ReadyEntry {
    // Higher priority first, FIFO within a priority
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedEntry {
    ready_at: Instant,
    seq: u64,
    priority: u8,
    job_id: Uuid,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    seq: u64,
    closed: bool,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Move every delayed entry that is due onto the ready heap
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse(entry)) = self.delayed.peek() {
            if entry.ready_at > now {
                break;
            }
            if let Some(Reverse(entry)) = self.delayed.pop() {
                self.ready.push(ReadyEntry {
                    priority: entry.priority,
                    seq: entry.seq,
                    job_id: entry.job_id,
                });
            }
        }
    }

    fn depth(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }
}

/// Priority queue of job ids with support for delayed (retry) entries
///
/// Only ids travel through the queue; workers reload the job row before
/// running it, so a stale entry for a job that already moved on is harmless.
#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a job to run as soon as a worker is free
    pub fn push(&self, job_id: Uuid, priority: Priority) {
        let depth = {
            let mut state = self.state();
            let seq = state.next_seq();
            state.ready.push(ReadyEntry {
                priority: priority.value(),
                seq,
                job_id,
            });
            state.depth()
        };
        metrics::set_queue_depth(depth);
        self.notify.notify_waiters();
    }

    /// Queue a job to become runnable after `delay`
    pub fn push_delayed(&self, job_id: Uuid, priority: Priority, delay: Duration) {
        if delay.is_zero() {
            return self.push(job_id, priority);
        }
        let depth = {
            let mut state = self.state();
            let seq = state.next_seq();
            state.delayed.push(Reverse(DelayedEntry {
                ready_at: Instant::now() + delay,
                seq,
                priority: priority.value(),
                job_id,
            }));
            state.depth()
        };
        metrics::set_queue_depth(depth);
        self.notify.notify_waiters();
    }

    /// Pop a runnable job without waiting
    pub fn try_pop(&self) -> Option<Uuid> {
        let mut state = self.state();
        state.promote_due(Instant::now());
        let popped = state.ready.pop().map(|entry| entry.job_id);
        if popped.is_some() {
            metrics::set_queue_depth(state.depth());
        }
        popped
    }

    /// Wait for the next runnable job
    ///
    /// Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Uuid> {
        self.wait_pop(false).await
    }

    /// Like [`pop`](Self::pop), but returns `None` as soon as nothing is
    /// queued at all, waiting out delayed entries first
    pub async fn pop_draining(&self) -> Option<Uuid> {
        self.wait_pop(true).await
    }

    async fn wait_pop(&self, drain: bool) -> Option<Uuid> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = self.state();
                state.promote_due(Instant::now());
                if let Some(entry) = state.ready.pop() {
                    metrics::set_queue_depth(state.depth());
                    return Some(entry.job_id);
                }
                if state.closed {
                    return None;
                }
                let next_due = state.delayed.peek().map(|Reverse(e)| e.ready_at);
                if drain && next_due.is_none() {
                    return None;
                }
                next_due
            };

            match next_due {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Entries waiting, ready or delayed
    pub fn len(&self) -> usize {
        self.state().depth()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out jobs and wake every waiting worker
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Creates jobs and feeds them to the run queue
pub struct Scheduler {
    store: Arc<dyn Persistence>,
    queue: Arc<JobQueue>,
    config: JobConfig,
    source_retries: HashMap<String, u32>,
}

impl Scheduler {
    /// Build a scheduler for the configured sources
    pub fn new(store: Arc<dyn Persistence>, config: &Config) -> Self {
        let source_retries = config
            .sources
            .iter()
            .map(|(name, source)| (name.clone(), source.max_retries))
            .collect();
        Self {
            store,
            queue: Arc::new(JobQueue::new()),
            config: config.jobs.clone(),
            source_retries,
        }
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Attempts allowed for a task: the source's override, else the default
    pub fn max_retries_for(&self, args: &TaskArgs) -> u32 {
        self.source_retries
            .get(args.source())
            .copied()
            .unwrap_or(self.config.default_max_retries)
    }

    /// Create a PENDING job and queue it
    pub fn enqueue(&self, args: TaskArgs, priority: Priority) -> JobResult<Uuid> {
        if let TaskArgs::FetchSource { source } | TaskArgs::FetchCountry { source, .. } = &args {
            if !self.source_retries.contains_key(source) {
                return Err(JobError::UnknownSource(source.clone()));
            }
        }
        let max_retries = self.max_retries_for(&args);
        let job = JobRecord::new(args, priority, max_retries);
        self.submit(&job)?;
        Ok(job.id)
    }

    /// Refresh every advisory of one source
    pub fn enqueue_source(&self, source: &str, priority: Priority) -> JobResult<Uuid> {
        self.enqueue(
            TaskArgs::FetchSource {
                source: source.to_string(),
            },
            priority,
        )
    }

    /// Refresh one country from one source
    pub fn enqueue_country(&self, source: &str, country: &str, priority: Priority) -> JobResult<Uuid> {
        self.enqueue(
            TaskArgs::FetchCountry {
                source: source.to_string(),
                country: country.to_string(),
            },
            priority,
        )
    }

    /// Aggregate across every enabled source
    pub fn enqueue_all(&self, country: Option<&str>, priority: Priority) -> JobResult<Uuid> {
        self.enqueue(
            TaskArgs::FetchAll {
                country: country.map(str::to_string),
            },
            priority,
        )
    }

    /// Persist a prepared PENDING job and queue it
    pub fn submit(&self, job: &JobRecord) -> JobResult<()> {
        self.store.create_job(job)?;
        self.queue.push(job.id, job.priority);
        tracing::info!(
            job_id = %job.id,
            kind = %job.kind(),
            source = %job.source(),
            priority = job.priority.value(),
            "Job enqueued"
        );
        Ok(())
    }

    /// Queue an already-persisted RETRY job after its backoff
    pub fn schedule_retry(&self, job: &JobRecord, delay: Duration) {
        self.queue.push_delayed(job.id, job.priority, delay);
    }

    /// Put a persisted PENDING or RETRY job back on the queue
    ///
    /// RETRY jobs keep their original `scheduled_at`.
    pub fn requeue_existing(&self, job: &JobRecord) -> bool {
        match job.status {
            JobStatus::Pending => {
                self.queue.push(job.id, job.priority);
                true
            }
            JobStatus::Retry => {
                let delay = (job.scheduled_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                self.queue.push_delayed(job.id, job.priority, delay);
                true
            }
            _ => false,
        }
    }

    /// Purge terminal jobs completed more than `retention` ago
    pub fn archive_completed(&self, retention: chrono::Duration) -> JobResult<usize> {
        let removed = self.store.purge_jobs_completed_before(Utc::now() - retention)?;
        if removed > 0 {
            tracing::info!(removed, "Archived completed jobs");
        }
        Ok(removed)
    }

    /// Purge with the configured retention window
    pub fn archive_expired(&self) -> JobResult<usize> {
        self.archive_completed(chrono::Duration::hours(self.config.retention_hours as i64))
    }

    /// Close the queue; workers exit after their current job
    pub fn shutdown(&self) {
        tracing::info!(queued = self.queue.len(), "Scheduler shutting down");
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::storage::SqliteStore;

    fn scheduler() -> Scheduler {
        let mut config = Config::default();
        config.sources.insert(
            "us".into(),
            SourceConfig {
                max_retries: 4,
                ..SourceConfig::default()
            },
        );
        Scheduler::new(Arc::new(SqliteStore::in_memory().unwrap()), &config)
    }

    #[test]
    fn test_queue_orders_by_priority_then_fifo() {
        let queue = JobQueue::new();
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        queue.push(a, Priority::Normal);
        queue.push(b, Priority::Critical);
        queue.push(c, Priority::Normal);
        queue.push(d, Priority::Low);

        assert_eq!(queue.try_pop(), Some(b));
        assert_eq!(queue.try_pop(), Some(a));
        assert_eq!(queue.try_pop(), Some(c));
        assert_eq!(queue.try_pop(), Some(d));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test]
    async fn test_delayed_entries_wait() {
        let queue = JobQueue::new();
        let id = Uuid::new_v4();
        queue.push_delayed(id, Priority::High, Duration::from_millis(40));

        assert_eq!(queue.try_pop(), None);
        assert_eq!(queue.len(), 1);

        let started = std::time::Instant::now();
        assert_eq!(queue.pop_draining().await, Some(id));
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(queue.pop_draining().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = Uuid::new_v4();
        queue.push(id, Priority::Normal);
        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    #[test]
    fn test_enqueue_persists_pending_job() {
        let scheduler = scheduler();
        let id = scheduler
            .enqueue_country("us", "France", Priority::High)
            .unwrap();

        let job = scheduler.store().get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_retries, 4);
        assert_eq!(job.country(), Some("France"));
        assert_eq!(scheduler.queue().try_pop(), Some(id));
    }

    #[test]
    fn test_enqueue_rejects_unknown_source() {
        let scheduler = scheduler();
        let err = scheduler
            .enqueue_source("atlantis", Priority::Normal)
            .unwrap_err();
        assert!(matches!(err, JobError::UnknownSource(s) if s == "atlantis"));
        assert!(scheduler.queue().is_empty());
    }

    #[test]
    fn test_fan_out_uses_default_retries() {
        let scheduler = scheduler();
        let id = scheduler.enqueue_all(None, Priority::Normal).unwrap();
        let job = scheduler.store().get_job(id).unwrap().unwrap();
        assert_eq!(job.max_retries, scheduler.config().default_max_retries);
    }

    #[test]
    fn test_requeue_existing_skips_terminal_jobs() {
        let scheduler = scheduler();
        let mut job = JobRecord::new(
            TaskArgs::FetchSource {
                source: "us".into(),
            },
            Priority::Normal,
            3,
        );
        assert!(scheduler.requeue_existing(&job));
        job.status = JobStatus::Success;
        assert!(!scheduler.requeue_existing(&job));
        assert_eq!(scheduler.queue().len(), 1);
    }
}
