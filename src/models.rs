// Core persisted data structures for wayfarer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a scheduled unit of work
///
/// Allowed transitions:
///
/// ```text
/// PENDING -> STARTED -> SUCCESS
///                    -> RETRY   -> STARTED
///                    -> FAILURE -> DEAD_LETTER
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Started,
    Retry,
    Success,
    Failure,
    DeadLetter,
}

impl JobStatus {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Started => "STARTED",
            Self::Retry => "RETRY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Parse from the stored representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "STARTED" => Some(Self::Started),
            "RETRY" => Some(Self::Retry),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "DEAD_LETTER" => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::DeadLetter)
    }

    /// Whether `next` is an allowed successor of this status
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Started)
                | (Started, Success)
                | (Started, Retry)
                | (Started, Failure)
                | (Retry, Started)
                | (Failure, DeadLetter)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of task a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Refresh every advisory of one source
    FetchSource,
    /// Refresh one country from one source
    FetchCountry,
    /// Aggregate across all enabled sources
    FetchAll,
}

impl TaskKind {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchSource => "fetch_source",
            Self::FetchCountry => "fetch_country",
            Self::FetchAll => "fetch_all",
        }
    }

    /// Get all kinds
    pub fn all() -> Vec<Self> {
        vec![Self::FetchSource, Self::FetchCountry, Self::FetchAll]
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed arguments of a job, one variant per task kind
///
/// Stored verbatim with the job and copied into the dead-letter record, so
/// a requeue rebuilds exactly the same task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskArgs {
    FetchSource { source: String },
    FetchCountry { source: String, country: String },
    FetchAll { country: Option<String> },
}

impl TaskArgs {
    /// Task kind of these arguments
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::FetchSource { .. } => TaskKind::FetchSource,
            Self::FetchCountry { .. } => TaskKind::FetchCountry,
            Self::FetchAll { .. } => TaskKind::FetchAll,
        }
    }

    /// Source targeted by the task; fan-out tasks report `"all"`
    pub fn source(&self) -> &str {
        match self {
            Self::FetchSource { source } | Self::FetchCountry { source, .. } => source,
            Self::FetchAll { .. } => ALL_SOURCES,
        }
    }

    /// Country targeted by the task, if any
    pub fn country(&self) -> Option<&str> {
        match self {
            Self::FetchSource { .. } => None,
            Self::FetchCountry { country, .. } => Some(country),
            Self::FetchAll { country } => country.as_deref(),
        }
    }
}

/// Pseudo-source label used by fan-out jobs
pub const ALL_SOURCES: &str = "all";

/// Queue priority of a job
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 5,
    High = 7,
    Critical = 9,
}

impl Priority {
    /// Numeric value (0-9, higher runs first)
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Map a stored numeric value back to the nearest level
    pub fn from_value(value: u8) -> Self {
        match value {
            0..=2 => Self::Low,
            3..=5 => Self::Normal,
            6..=7 => Self::High,
            _ => Self::Critical,
        }
    }

    /// Parse from name
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// One scheduled unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub args: TaskArgs,
    pub priority: Priority,
    pub status: JobStatus,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Attempts allowed before the job is dead-lettered
    pub max_retries: u32,
    /// Attempts spent by earlier incarnations (dead-letter requeues)
    pub previous_attempts: u32,
    /// Job this one was requeued from, if any
    pub requeued_from: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
}

impl JobRecord {
    /// Create a new pending job
    pub fn new(args: TaskArgs, priority: Priority, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            args,
            priority,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries,
            previous_attempts: 0,
            requeued_from: None,
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_message: None,
        }
    }

    /// Task kind
    pub fn kind(&self) -> TaskKind {
        self.args.kind()
    }

    /// Source label
    pub fn source(&self) -> &str {
        self.args.source()
    }

    /// Target country, if any
    pub fn country(&self) -> Option<&str> {
        self.args.country()
    }

    /// Attempts across all incarnations of this unit of work
    pub fn total_attempts(&self) -> u32 {
        self.previous_attempts + self.retry_count
    }
}

/// Durable record of a job that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub original_job_id: Uuid,
    pub task_kind: TaskKind,
    pub original_args: TaskArgs,
    pub failure_reason: String,
    pub total_retry_attempts: u32,
    pub processed: bool,
    pub manual_intervention_required: bool,
    /// Job created when this record was requeued
    pub requeued_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl DeadLetterRecord {
    /// Copy a failed job's identity and arguments into a dead-letter record
    pub fn from_job(job: &JobRecord, failure_reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_job_id: job.id,
            task_kind: job.kind(),
            original_args: job.args.clone(),
            failure_reason: failure_reason.into(),
            total_retry_attempts: job.total_attempts(),
            processed: false,
            manual_intervention_required: false,
            requeued_job_id: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }
}

/// Durable hourly request budget for one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateWindow {
    pub source: String,
    /// Start of the clock hour this window covers
    pub window_start: DateTime<Utc>,
    pub requests_made: u32,
    pub requests_allowed: u32,
}

impl RateWindow {
    /// Requests left in this window
    pub fn remaining(&self) -> u32 {
        self.requests_allowed.saturating_sub(self.requests_made)
    }

    /// Whether the budget is used up
    pub fn is_exhausted(&self) -> bool {
        self.requests_made >= self.requests_allowed
    }
}

/// Health classification derived from a success rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Classify a success rate: >= 0.8 healthy, >= 0.5 degraded, else unhealthy
    pub fn from_success_rate(rate: f64) -> Self {
        if rate >= 0.8 {
            Self::Healthy
        } else if rate >= 0.5 {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Rolled-up job outcomes for one source over one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsWindow {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub source: String,
    pub total_jobs: u32,
    pub successful_jobs: u32,
    pub failed_jobs: u32,
    pub retried_jobs: u32,
    pub dead_letter_jobs: u32,
    pub avg_duration_ms: Option<f64>,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    pub p50_duration_ms: Option<f64>,
    pub p95_duration_ms: Option<f64>,
    pub success_rate: f64,
    pub health: HealthStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Started));
        assert!(Started.can_transition_to(Success));
        assert!(Started.can_transition_to(Retry));
        assert!(Started.can_transition_to(Failure));
        assert!(Retry.can_transition_to(Started));
        assert!(Failure.can_transition_to(DeadLetter));

        assert!(!Pending.can_transition_to(Success));
        assert!(!Retry.can_transition_to(DeadLetter));
        assert!(!Success.can_transition_to(Started));
        assert!(!DeadLetter.can_transition_to(Pending));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
        assert!(!JobStatus::Failure.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Started,
            JobStatus::Retry,
            JobStatus::Success,
            JobStatus::Failure,
            JobStatus::DeadLetter,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn test_task_args_tagged_json() {
        let args = TaskArgs::FetchCountry {
            source: "us_state".into(),
            country: "France".into(),
        };
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json["kind"], "fetch_country");
        assert_eq!(json["country"], "France");

        let back: TaskArgs = serde_json::from_value(json).unwrap();
        assert_eq!(back, args);
        assert_eq!(back.kind(), TaskKind::FetchCountry);
        assert_eq!(back.source(), "us_state");
    }

    #[test]
    fn test_fan_out_source_label() {
        let args = TaskArgs::FetchAll { country: None };
        assert_eq!(args.source(), ALL_SOURCES);
        assert_eq!(args.country(), None);
    }

    #[test]
    fn test_dead_letter_copies_job_identity() {
        let mut job = JobRecord::new(
            TaskArgs::FetchSource {
                source: "uk".into(),
            },
            Priority::High,
            3,
        );
        job.retry_count = 3;
        job.previous_attempts = 2;

        let record = DeadLetterRecord::from_job(&job, "503 from source");
        assert_eq!(record.original_job_id, job.id);
        assert_eq!(record.original_args, job.args);
        assert_eq!(record.task_kind, TaskKind::FetchSource);
        assert_eq!(record.total_retry_attempts, 5);
        assert!(!record.processed);
        assert!(!record.manual_intervention_required);
    }

    #[test]
    fn test_priority_values() {
        assert!(Priority::Critical > Priority::High);
        assert_eq!(Priority::from_value(Priority::High.value()), Priority::High);
        assert_eq!(Priority::parse("LOW"), Some(Priority::Low));
    }

    #[test]
    fn test_health_classification() {
        assert_eq!(HealthStatus::from_success_rate(0.95), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_success_rate(0.8), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from_success_rate(0.6), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_success_rate(0.5), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from_success_rate(0.2), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_rate_window_budget() {
        let window = RateWindow {
            source: "us".into(),
            window_start: Utc::now(),
            requests_made: 60,
            requests_allowed: 60,
        };
        assert!(window.is_exhausted());
        assert_eq!(window.remaining(), 0);
    }
}
