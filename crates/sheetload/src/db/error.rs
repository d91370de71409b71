//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A table or column name failed validation.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A transaction was rolled back on request (e.g. the owning task timed out).
    #[error("Transaction aborted: {0}")]
    Aborted(String),

    /// The job a load was completing had left `processing` (deleted, or
    /// failed by someone else), so the load was rolled back.
    #[error("Job {0} is no longer processing")]
    StaleJob(String),

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl DatabaseError {
    /// Whether retrying the same write could succeed (busy/locked/IO hiccups).
    pub fn is_retryable(&self) -> bool {
        matches!(self, DatabaseError::Sqlite(_))
    }
}
