//! Durable storage for jobs, dead letters, rate windows and metrics
//!
//! This module handles persistence with SQLite. All worker processes share
//! one database file; shared counters and job rows are only ever changed
//! through atomic statements or transactions.

pub mod repository;

pub use repository::{Persistence, SqliteStore, StorageResult};

use std::sync::Arc;

use crate::config::DatabaseConfig;

/// Open the configured store as a shared trait object
pub fn open(config: &DatabaseConfig) -> StorageResult<Arc<dyn Persistence>> {
    let store = SqliteStore::new(&config.sqlite_path)?;
    Ok(Arc::new(store))
}
