//! Job lifecycle, scheduling and dead-letter recovery
//!
//! # Overview
//!
//! Every unit of work is a persisted [`JobRecord`] moving along a fixed
//! graph:
//!
//! ```text
//! PENDING ──▶ STARTED ──▶ SUCCESS
//!               │  ▲
//!               │  └──── RETRY ◀──┐
//!               ├─────────────────┘   (failed, attempts left)
//!               └──▶ FAILURE ──▶ DEAD_LETTER
//! ```
//!
//! Task handlers never decide what happens after a failure. They return a
//! [`TaskOutcome`]; the pure function [`decide`] alone turns it into the
//! next [`Transition`], which the worker persists.
//!
//! # Modules
//!
//! - [`scheduler`] - enqueueing, the in-process priority queue, retention
//! - [`registry`] - task kind to handler mapping
//! - [`worker`] - the execution loop and crash recovery
//! - [`dead_letter`] - bounded requeue or manual review of exhausted jobs

pub mod dead_letter;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use dead_letter::{BatchReport, DeadLetterManager};
pub use error::{JobError, JobResult};
pub use registry::{TaskHandler, TaskRegistry};
pub use scheduler::{JobQueue, Scheduler};
pub use worker::{RecoveryReport, Worker};

use std::time::Duration;

use crate::models::JobRecord;
use crate::utils::error::FetchError;
use crate::utils::retry::RetryConfig;

/// What a task handler reports back to the worker
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The task completed
    Success {
        /// Advisories produced
        records: usize,
    },
    /// The task failed
    Failed {
        error: String,
        /// Whether running the task again later may succeed
        retryable: bool,
        /// Server-requested minimum wait before the next attempt
        retry_after: Option<Duration>,
    },
}

impl TaskOutcome {
    /// Classify a source failure for task-level retry
    pub fn from_fetch_error(error: &FetchError) -> Self {
        Self::Failed {
            error: error.to_string(),
            retryable: !error.is_permanent(),
            retry_after: error.retry_after(),
        }
    }

    /// Failure that will never succeed on retry
    pub fn permanent(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            retryable: false,
            retry_after: None,
        }
    }

    /// Failure that may clear on its own
    pub fn transient(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
            retryable: true,
            retry_after: None,
        }
    }
}

/// The next lifecycle step for a job that just ran
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// STARTED -> SUCCESS
    Succeed,
    /// STARTED -> RETRY, run again after `delay`
    Retry { retry_count: u32, delay: Duration },
    /// STARTED -> FAILURE -> DEAD_LETTER
    DeadLetter { retry_count: u32, reason: String },
}

/// Decide the transition for `job` after `outcome`
///
/// `retry_count` counts failed attempts; a job is dead-lettered once it
/// reaches `max_retries`, so it never runs more than `max_retries` times.
/// The retry delay is `base * 2^retry_count` (capped, jittered) and never
/// shorter than a server-provided Retry-After.
pub fn decide(job: &JobRecord, outcome: &TaskOutcome, backoff: &RetryConfig) -> Transition {
    match outcome {
        TaskOutcome::Success { .. } => Transition::Succeed,
        TaskOutcome::Failed {
            error,
            retryable,
            retry_after,
        } => {
            let retry_count = job.retry_count.saturating_add(1);
            if !retryable {
                return Transition::DeadLetter {
                    retry_count,
                    reason: format!("permanent failure: {error}"),
                };
            }
            if retry_count >= job.max_retries {
                return Transition::DeadLetter {
                    retry_count,
                    reason: format!("retries exhausted after {retry_count} attempts: {error}"),
                };
            }

            // delay_for(n) = base * 2^(n-1)
            let mut delay = backoff.delay_for(retry_count + 1);
            if let Some(hint) = retry_after {
                delay = delay.max(*hint);
            }
            Transition::Retry { retry_count, delay }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, TaskArgs};

    fn job(retry_count: u32, max_retries: u32) -> JobRecord {
        let mut job = JobRecord::new(
            TaskArgs::FetchSource {
                source: "us".into(),
            },
            Priority::Normal,
            max_retries,
        );
        job.retry_count = retry_count;
        job
    }

    fn backoff() -> RetryConfig {
        RetryConfig::with_delays(u32::MAX, 60_000, 3_600_000).without_jitter()
    }

    #[test]
    fn test_success() {
        assert_eq!(
            decide(&job(0, 3), &TaskOutcome::Success { records: 4 }, &backoff()),
            Transition::Succeed
        );
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let failure = TaskOutcome::transient("503");
        assert_eq!(
            decide(&job(0, 3), &failure, &backoff()),
            Transition::Retry {
                retry_count: 1,
                delay: Duration::from_secs(120),
            }
        );
        assert_eq!(
            decide(&job(1, 3), &failure, &backoff()),
            Transition::Retry {
                retry_count: 2,
                delay: Duration::from_secs(240),
            }
        );
    }

    #[test]
    fn test_third_failure_dead_letters_with_three_retries() {
        let transition = decide(&job(2, 3), &TaskOutcome::transient("503"), &backoff());
        assert!(matches!(
            transition,
            Transition::DeadLetter { retry_count: 3, .. }
        ));
    }

    #[test]
    fn test_permanent_failure_skips_retries() {
        let transition = decide(&job(0, 3), &TaskOutcome::permanent("401"), &backoff());
        match transition {
            Transition::DeadLetter {
                retry_count,
                reason,
            } => {
                assert_eq!(retry_count, 1);
                assert!(reason.contains("permanent"));
            }
            other => panic!("unexpected transition: {other:?}"),
        }
    }

    #[test]
    fn test_retry_after_extends_delay() {
        let outcome = TaskOutcome::from_fetch_error(&FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(900)),
        });
        assert_eq!(
            decide(&job(0, 5), &outcome, &backoff()),
            Transition::Retry {
                retry_count: 1,
                delay: Duration::from_secs(900),
            }
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let capped = RetryConfig::with_delays(u32::MAX, 60_000, 300_000).without_jitter();
        assert_eq!(
            decide(&job(8, 20), &TaskOutcome::transient("503"), &capped),
            Transition::Retry {
                retry_count: 9,
                delay: Duration::from_secs(300),
            }
        );
    }

    #[test]
    fn test_fetch_error_classification() {
        assert!(matches!(
            TaskOutcome::from_fetch_error(&FetchError::Auth),
            TaskOutcome::Failed {
                retryable: false,
                ..
            }
        ));
        assert!(matches!(
            TaskOutcome::from_fetch_error(&FetchError::BreakerOpen {
                source_name: "us".into()
            }),
            TaskOutcome::Failed {
                retryable: true,
                ..
            }
        ));
    }
}
