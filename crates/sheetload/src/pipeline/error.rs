use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::{ErrorKind, ParseError, StorageError};
use crate::job::JobStatus;

/// Why a task failed, classified for the job record.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Job {id} is {status}, expected pending")]
    NotPending { id: String, status: JobStatus },

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Database write failed: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Table '{0}' is reserved and cannot be loaded into")]
    ReservedTable(String),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::JobNotFound(_) => ErrorKind::NotFound,
            IngestError::NotPending { .. }
            | IngestError::ReservedTable(_)
            | IngestError::Database(DatabaseError::StaleJob(_)) => ErrorKind::Internal,
            IngestError::Parse(ParseError::UnsupportedFormat(_)) => ErrorKind::UnsupportedFormat,
            IngestError::Parse(_) => ErrorKind::ParseError,
            IngestError::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            IngestError::Storage(_) => ErrorKind::StorageError,
            IngestError::Database(DatabaseError::Aborted(_)) | IngestError::Cancelled(_) => {
                ErrorKind::Timeout
            }
            IngestError::Database(_) => ErrorKind::DatabaseError,
        }
    }

    /// Whether the failure should be written to the job. A missing job has
    /// nothing to record on, and a job that was not pending belongs to
    /// whoever moved it.
    pub fn is_recordable(&self) -> bool {
        !matches!(
            self,
            IngestError::JobNotFound(_) | IngestError::NotPending { .. }
        )
    }
}
