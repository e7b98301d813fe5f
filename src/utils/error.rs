//! Error types for outbound source access
//!
//! This module defines the error taxonomy shared by the rate governor,
//! circuit breaker, cached HTTP client and source adapters.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to an external source
#[derive(Error, Debug)]
pub enum FetchError {
    /// Credentials rejected (401). Never retried, surfaced to operators.
    #[error("Authentication rejected by source")]
    Auth,

    /// Source asked us to slow down (429)
    #[error("Rate limited by source (retry after {retry_after:?})")]
    RateLimited {
        /// Value of the Retry-After header, if any
        retry_after: Option<Duration>,
    },

    /// Server-side failure (5xx)
    #[error("Transient server error: {status}")]
    Transient {
        /// HTTP status code
        status: u16,
    },

    /// Caller-side failure (4xx other than 401/429)
    #[error("Client error: {status}")]
    Client {
        /// HTTP status code
        status: u16,
    },

    /// Request timeout
    #[error("Request timeout")]
    Timeout,

    /// Circuit breaker refused the call
    #[error("Circuit breaker open for source '{source_name}'")]
    BreakerOpen {
        /// Source whose breaker is open
        source_name: String,
    },

    /// Network or protocol error from the HTTP stack
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Requested advisory does not exist at the source
    #[error("Advisory not found: {0}")]
    NotFound(String),

    /// Payload could not be decoded
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Rate governor bookkeeping failed
    #[error("Rate governor error: {0}")]
    Governor(String),
}

impl FetchError {
    /// Whether a retry of the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Timeout | Self::RateLimited { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Whether this failure should count against the source's circuit breaker
    ///
    /// Only failures that say something about the health of the source
    /// count. Breaker rejections never count as new failures.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::Timeout | Self::RateLimited { .. } | Self::Http(_)
        )
    }

    /// Whether repeating the whole task later cannot help
    ///
    /// Breaker rejections and exhausted request retries are not permanent:
    /// the source may have recovered by the time a job is retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Auth
                | Self::Client { .. }
                | Self::InvalidUrl(_)
                | Self::NotFound(_)
                | Self::Decode(_)
        )
    }

    /// Server-provided wait hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short stable label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::Transient { .. } => "transient",
            Self::Client { .. } => "client",
            Self::Timeout => "timeout",
            Self::BreakerOpen { .. } => "breaker_open",
            Self::Http(_) => "http",
            Self::InvalidUrl(_) => "invalid_url",
            Self::NotFound(_) => "not_found",
            Self::Decode(_) => "decode",
            Self::Governor(_) => "governor",
        }
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            401 => Self::Auth,
            429 => Self::RateLimited { retry_after },
            500..=599 => Self::Transient { status },
            _ => Self::Client { status },
        }
    }
}

/// Errors raised by the persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored value is not a recognized enum variant
    #[error("Corrupt row in '{table}': {reason}")]
    Corrupt {
        /// Table holding the row
        table: &'static str,
        /// What was wrong
        reason: String,
    },

    /// Filesystem failure while opening the database
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
