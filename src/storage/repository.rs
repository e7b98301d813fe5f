//! Repository Pattern for Job and Governance Persistence
//!
//! This module provides the trait-based persistence seam consumed by the
//! scheduler, worker, dead-letter manager, rate governor and metrics rollup,
//! plus its SQLite implementation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │   Scheduler · Worker · DeadLetterManager · RateGovernor     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Persistence trait                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                 ┌─────────────────────────┐
//!                 │   SqliteStore (WAL)     │
//!                 └─────────────────────────┘
//! ```
//!
//! Every status change is a compare-and-set against the expected prior
//! status, and multi-row changes (dead-lettering, requeueing) run inside a
//! single transaction, so readers never observe a half-applied transition.
//! The hourly rate window is booked with a conditional upsert that refuses
//! to exceed its allowance.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

use crate::models::{
    DeadLetterRecord, JobRecord, JobStatus, MetricsWindow, Priority, RateWindow, TaskArgs,
    TaskKind,
};
use crate::utils::error::StorageError;

/// Result type for persistence operations
pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================================
// Repository Trait
// ============================================================================

/// Durable store shared by every worker process
pub trait Persistence: Send + Sync {
    /// Insert a freshly scheduled job
    fn create_job(&self, job: &JobRecord) -> StorageResult<()>;

    /// Fetch a job by id
    fn get_job(&self, id: Uuid) -> StorageResult<Option<JobRecord>>;

    /// Persist `job` only if the stored status still equals `expected`
    ///
    /// Returns `false` when another writer moved the job first.
    fn update_job_status(&self, job: &JobRecord, expected: JobStatus) -> StorageResult<bool>;

    /// Move a FAILURE job to DEAD_LETTER and insert its dead-letter record
    /// in one transaction
    ///
    /// Returns `false` (and writes nothing) when the job is not in FAILURE.
    fn create_dead_letter_record(
        &self,
        job: &JobRecord,
        record: &DeadLetterRecord,
    ) -> StorageResult<bool>;

    /// Jobs currently in `status`, oldest first
    fn jobs_by_status(&self, status: JobStatus) -> StorageResult<Vec<JobRecord>>;

    /// Jobs that reached a terminal status within `[start, end)`
    fn jobs_completed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<JobRecord>>;

    /// Delete terminal jobs completed before `cutoff`; returns rows removed
    fn purge_jobs_completed_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;

    /// Fetch a dead-letter record by id
    fn get_dead_letter(&self, id: Uuid) -> StorageResult<Option<DeadLetterRecord>>;

    /// Dead-letter records created for a job
    fn dead_letters_for_job(&self, job_id: Uuid) -> StorageResult<Vec<DeadLetterRecord>>;

    /// Unprocessed records not awaiting manual review, oldest first
    fn unprocessed_dead_letters(&self, limit: usize) -> StorageResult<Vec<DeadLetterRecord>>;

    /// Claim a record for requeueing and insert `job` in one transaction
    ///
    /// The claim only succeeds while the record has no requeued job and,
    /// unless `force` is set, is neither processed nor awaiting review.
    /// Returns `false` (and inserts nothing) when another writer got there
    /// first.
    fn requeue_dead_letter(
        &self,
        dead_letter_id: Uuid,
        job: &JobRecord,
        force: bool,
    ) -> StorageResult<bool>;

    /// Flag an unprocessed record for manual review
    ///
    /// Returns `false` when the record was already processed or flagged.
    fn flag_dead_letter_manual(&self, dead_letter_id: Uuid) -> StorageResult<bool>;

    /// Close a record without requeueing it
    ///
    /// Returns `false` when the record was already processed.
    fn resolve_dead_letter(&self, dead_letter_id: Uuid) -> StorageResult<bool>;

    /// Current hourly window for a source
    fn rate_window(
        &self,
        source: &str,
        window_start: DateTime<Utc>,
    ) -> StorageResult<Option<RateWindow>>;

    /// Atomically book one request in the window (upserting it)
    ///
    /// Returns `false` when the window is already at `requests_allowed`.
    fn upsert_rate_window(
        &self,
        source: &str,
        window_start: DateTime<Utc>,
        requests_allowed: u32,
    ) -> StorageResult<bool>;

    /// Append one rolled-up metrics window
    fn append_metrics_window(&self, window: &MetricsWindow) -> StorageResult<()>;

    /// Most recent metrics windows, newest first
    fn recent_metrics_windows(&self, limit: usize) -> StorageResult<Vec<MetricsWindow>>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of [`Persistence`]
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency across worker processes
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite store initialized");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_schema(&self) -> StorageResult<()> {
        self.conn().execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    task_kind TEXT NOT NULL,
                    source TEXT NOT NULL,
                    country TEXT,
                    args TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL,
                    previous_attempts INTEGER NOT NULL DEFAULT 0,
                    requeued_from TEXT,
                    scheduled_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    duration_ms INTEGER,
                    error_message TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_jobs_completed_at ON jobs(completed_at);

                CREATE TABLE IF NOT EXISTS dead_letters (
                    id TEXT PRIMARY KEY,
                    original_job_id TEXT NOT NULL,
                    task_kind TEXT NOT NULL,
                    original_args TEXT NOT NULL,
                    failure_reason TEXT NOT NULL,
                    total_retry_attempts INTEGER NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0,
                    manual_intervention_required INTEGER NOT NULL DEFAULT 0,
                    requeued_job_id TEXT,
                    created_at TEXT NOT NULL,
                    processed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_dead_letters_pending
                    ON dead_letters(processed, manual_intervention_required);

                CREATE TABLE IF NOT EXISTS rate_windows (
                    source TEXT NOT NULL,
                    window_start TEXT NOT NULL,
                    requests_made INTEGER NOT NULL,
                    requests_allowed INTEGER NOT NULL,
                    PRIMARY KEY (source, window_start)
                );

                CREATE TABLE IF NOT EXISTS metrics_windows (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source TEXT NOT NULL,
                    period_start TEXT NOT NULL,
                    period_end TEXT NOT NULL,
                    payload TEXT NOT NULL
                );
                "#,
        )?;

        Ok(())
    }
}

const JOB_COLUMNS: &str = "id, args, priority, status, retry_count, max_retries, \
     previous_attempts, requeued_from, scheduled_at, started_at, completed_at, \
     duration_ms, error_message";

const DEAD_LETTER_COLUMNS: &str = "id, original_job_id, task_kind, original_args, \
     failure_reason, total_retry_attempts, processed, manual_intervention_required, \
     requeued_job_id, created_at, processed_at";

fn insert_job(conn: &Connection, job: &JobRecord) -> StorageResult<()> {
    conn.execute(
        r#"
            INSERT INTO jobs (id, task_kind, source, country, args, priority, status,
                              retry_count, max_retries, previous_attempts, requeued_from,
                              scheduled_at, started_at, completed_at, duration_ms, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        params![
            job.id.to_string(),
            job.kind().as_str(),
            job.source(),
            job.country(),
            serde_json::to_string(&job.args)?,
            job.priority.value(),
            job.status.as_str(),
            job.retry_count,
            job.max_retries,
            job.previous_attempts,
            job.requeued_from.map(|id| id.to_string()),
            fmt_ts(job.scheduled_at),
            job.started_at.map(fmt_ts),
            job.completed_at.map(fmt_ts),
            job.duration_ms.map(|d| d as i64),
            job.error_message,
        ],
    )?;
    Ok(())
}

impl Persistence for SqliteStore {
    fn create_job(&self, job: &JobRecord) -> StorageResult<()> {
        insert_job(&self.conn(), job)
    }

    fn get_job(&self, id: Uuid) -> StorageResult<Option<JobRecord>> {
        let conn = self.conn();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    fn update_job_status(&self, job: &JobRecord, expected: JobStatus) -> StorageResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            r#"
                UPDATE jobs SET status = ?1, retry_count = ?2, scheduled_at = ?3,
                                started_at = ?4, completed_at = ?5, duration_ms = ?6,
                                error_message = ?7
                WHERE id = ?8 AND status = ?9
                "#,
            params![
                job.status.as_str(),
                job.retry_count,
                fmt_ts(job.scheduled_at),
                job.started_at.map(fmt_ts),
                job.completed_at.map(fmt_ts),
                job.duration_ms.map(|d| d as i64),
                job.error_message,
                job.id.to_string(),
                expected.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn create_dead_letter_record(
        &self,
        job: &JobRecord,
        record: &DeadLetterRecord,
    ) -> StorageResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = tx.execute(
            r#"
                UPDATE jobs SET status = ?1, completed_at = ?2, error_message = ?3
                WHERE id = ?4 AND status = ?5
                "#,
            params![
                JobStatus::DeadLetter.as_str(),
                job.completed_at.map(fmt_ts),
                job.error_message,
                job.id.to_string(),
                JobStatus::Failure.as_str(),
            ],
        )?;
        if changed != 1 {
            return Ok(false);
        }

        tx.execute(
            &format!(
                "INSERT INTO dead_letters ({DEAD_LETTER_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                record.id.to_string(),
                record.original_job_id.to_string(),
                record.task_kind.as_str(),
                serde_json::to_string(&record.original_args)?,
                record.failure_reason,
                record.total_retry_attempts,
                record.processed,
                record.manual_intervention_required,
                record.requeued_job_id.map(|id| id.to_string()),
                fmt_ts(record.created_at),
                record.processed_at.map(fmt_ts),
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    fn jobs_by_status(&self, status: JobStatus) -> StorageResult<Vec<JobRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY scheduled_at ASC"
        ))?;
        let jobs = stmt
            .query_map(params![status.as_str()], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn jobs_completed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<JobRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE completed_at IS NOT NULL AND completed_at >= ?1 AND completed_at < ?2 \
             ORDER BY completed_at ASC"
        ))?;
        let jobs = stmt
            .query_map(params![fmt_ts(start), fmt_ts(end)], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn purge_jobs_completed_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let conn = self.conn();
        let removed = conn.execute(
            "DELETE FROM jobs WHERE status IN (?1, ?2) AND completed_at < ?3",
            params![
                JobStatus::Success.as_str(),
                JobStatus::DeadLetter.as_str(),
                fmt_ts(cutoff)
            ],
        )?;
        Ok(removed)
    }

    fn get_dead_letter(&self, id: Uuid) -> StorageResult<Option<DeadLetterRecord>> {
        let conn = self.conn();
        let record = conn
            .query_row(
                &format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = ?1"),
                params![id.to_string()],
                dead_letter_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn dead_letters_for_job(&self, job_id: Uuid) -> StorageResult<Vec<DeadLetterRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE original_job_id = ?1"
        ))?;
        let records = stmt
            .query_map(params![job_id.to_string()], dead_letter_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn unprocessed_dead_letters(&self, limit: usize) -> StorageResult<Vec<DeadLetterRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters \
             WHERE processed = 0 AND manual_intervention_required = 0 \
             ORDER BY created_at ASC LIMIT ?1"
        ))?;
        let records = stmt
            .query_map(params![limit as i64], dead_letter_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn requeue_dead_letter(
        &self,
        dead_letter_id: Uuid,
        job: &JobRecord,
        force: bool,
    ) -> StorageResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claimed = tx.execute(
            r#"
                UPDATE dead_letters SET processed = 1, manual_intervention_required = 0,
                                        requeued_job_id = ?1, processed_at = ?2
                WHERE id = ?3 AND requeued_job_id IS NULL
                  AND (?4 OR (processed = 0 AND manual_intervention_required = 0))
                "#,
            params![
                job.id.to_string(),
                fmt_ts(Utc::now()),
                dead_letter_id.to_string(),
                force,
            ],
        )?;
        if claimed == 0 {
            // Dropping the transaction rolls it back
            return Ok(false);
        }
        insert_job(&tx, job)?;
        tx.commit()?;
        Ok(true)
    }

    fn flag_dead_letter_manual(&self, dead_letter_id: Uuid) -> StorageResult<bool> {
        let changed = self.conn().execute(
            "UPDATE dead_letters SET manual_intervention_required = 1 \
             WHERE id = ?1 AND processed = 0 AND manual_intervention_required = 0",
            params![dead_letter_id.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn resolve_dead_letter(&self, dead_letter_id: Uuid) -> StorageResult<bool> {
        let changed = self.conn().execute(
            "UPDATE dead_letters SET processed = 1, processed_at = ?1 \
             WHERE id = ?2 AND processed = 0",
            params![fmt_ts(Utc::now()), dead_letter_id.to_string()],
        )?;
        Ok(changed == 1)
    }

    fn rate_window(
        &self,
        source: &str,
        window_start: DateTime<Utc>,
    ) -> StorageResult<Option<RateWindow>> {
        let conn = self.conn();
        let window = conn
            .query_row(
                "SELECT requests_made, requests_allowed FROM rate_windows \
                 WHERE source = ?1 AND window_start = ?2",
                params![source, fmt_ts(window_start)],
                |row| {
                    Ok(RateWindow {
                        source: source.to_string(),
                        window_start,
                        requests_made: row.get(0)?,
                        requests_allowed: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(window)
    }

    fn upsert_rate_window(
        &self,
        source: &str,
        window_start: DateTime<Utc>,
        requests_allowed: u32,
    ) -> StorageResult<bool> {
        if requests_allowed == 0 {
            return Ok(false);
        }

        // IMMEDIATE takes the write lock up front so busy_timeout covers
        // contention from other processes sharing the file
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            r#"
                INSERT INTO rate_windows (source, window_start, requests_made, requests_allowed)
                VALUES (?1, ?2, 1, ?3)
                ON CONFLICT(source, window_start) DO UPDATE SET
                    requests_made = requests_made + 1,
                    requests_allowed = excluded.requests_allowed
                WHERE rate_windows.requests_made < excluded.requests_allowed
                "#,
            params![source, fmt_ts(window_start), requests_allowed],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    fn append_metrics_window(&self, window: &MetricsWindow) -> StorageResult<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO metrics_windows (source, period_start, period_end, payload) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                window.source,
                fmt_ts(window.period_start),
                fmt_ts(window.period_end),
                serde_json::to_string(window)?,
            ],
        )?;
        Ok(())
    }

    fn recent_metrics_windows(&self, limit: usize) -> StorageResult<Vec<MetricsWindow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT payload FROM metrics_windows ORDER BY period_end DESC, id DESC LIMIT ?1",
        )?;
        let payloads = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        payloads
            .iter()
            .map(|p| serde_json::from_str(p).map_err(StorageError::from))
            .collect()
    }
}

// ============================================================================
// Row Mapping
// ============================================================================

/// Fixed-width RFC 3339 so lexical order matches time order
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| conversion_error(idx, e)),
        None => Ok(None),
    }
}

fn args_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<TaskArgs> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

#[derive(Debug)]
struct UnknownVariant(String);

impl std::fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown variant '{}'", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let status_raw: String = row.get(3)?;
    let status = JobStatus::parse(&status_raw)
        .ok_or_else(|| conversion_error(3, UnknownVariant(status_raw.clone())))?;

    Ok(JobRecord {
        id: uuid_at(row, 0)?,
        args: args_at(row, 1)?,
        priority: Priority::from_value(row.get::<_, u8>(2)?),
        status,
        retry_count: row.get(4)?,
        max_retries: row.get(5)?,
        previous_attempts: row.get(6)?,
        requeued_from: opt_uuid_at(row, 7)?,
        scheduled_at: ts_at(row, 8)?,
        started_at: opt_ts_at(row, 9)?,
        completed_at: opt_ts_at(row, 10)?,
        duration_ms: row.get::<_, Option<i64>>(11)?.map(|d| d.max(0) as u64),
        error_message: row.get(12)?,
    })
}

fn dead_letter_from_row(row: &Row<'_>) -> rusqlite::Result<DeadLetterRecord> {
    let original_args: TaskArgs = args_at(row, 3)?;
    let kind_raw: String = row.get(2)?;
    let task_kind = TaskKind::all()
        .into_iter()
        .find(|k| k.as_str() == kind_raw)
        .ok_or_else(|| conversion_error(2, UnknownVariant(kind_raw.clone())))?;

    Ok(DeadLetterRecord {
        id: uuid_at(row, 0)?,
        original_job_id: uuid_at(row, 1)?,
        task_kind,
        original_args,
        failure_reason: row.get(4)?,
        total_retry_attempts: row.get(5)?,
        processed: row.get(6)?,
        manual_intervention_required: row.get(7)?,
        requeued_job_id: opt_uuid_at(row, 8)?,
        created_at: ts_at(row, 9)?,
        processed_at: opt_ts_at(row, 10)?,
    })
}
