//! Error types for the job lifecycle

use thiserror::Error;
use uuid::Uuid;

use crate::models::{JobStatus, TaskKind};
use crate::utils::error::StorageError;

/// Result type for job operations
pub type JobResult<T> = Result<T, JobError>;

/// Job lifecycle errors
#[derive(Error, Debug)]
pub enum JobError {
    /// Persistence failed
    #[error("Job storage error: {0}")]
    Storage(#[from] StorageError),

    /// Job does not exist (never created or already archived)
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    /// Dead-letter record does not exist
    #[error("Dead-letter record not found: {0}")]
    DeadLetterNotFound(Uuid),

    /// Transition is not on the allowed lifecycle graph
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// Another writer changed the job first
    #[error("Job {job_id} is no longer {expected}")]
    Conflict { job_id: Uuid, expected: JobStatus },

    /// No handler registered for a task kind
    #[error("No handler registered for task kind '{0}'")]
    NoHandler(TaskKind),

    /// Task arguments name a source that is not configured
    #[error("Unknown source '{0}'")]
    UnknownSource(String),
}

impl JobError {
    /// Whether the operation may succeed if attempted again
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Conflict { .. })
    }
}
