use std::time::Duration;

use crate::error::ErrorKind;
use crate::storage::UploadPayload;

/// Where an ingestion task reads its file from.
#[derive(Debug, Clone)]
pub enum IngestSource {
    /// Bytes received with the request.
    Bytes(Vec<u8>),
    /// Key of an object in the bucket.
    Object(String),
}

#[derive(Debug, Clone)]
pub enum TaskKind {
    Ingest {
        filename: String,
        source: IngestSource,
    },
    StorageUpload {
        payload: UploadPayload,
        preserve_filename: bool,
    },
    AnalyticsBuild,
}

/// Unit of work handed to the worker pool. Always tied to a persisted job.
#[derive(Debug, Clone)]
pub struct Task {
    pub job_id: String,
    pub kind: TaskKind,
}

impl Task {
    pub fn ingest(job_id: impl Into<String>, filename: impl Into<String>, source: IngestSource) -> Self {
        Self {
            job_id: job_id.into(),
            kind: TaskKind::Ingest {
                filename: filename.into(),
                source,
            },
        }
    }

    pub fn storage_upload(
        job_id: impl Into<String>,
        payload: UploadPayload,
        preserve_filename: bool,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            kind: TaskKind::StorageUpload {
                payload,
                preserve_filename,
            },
        }
    }

    pub fn analytics_build(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            kind: TaskKind::AnalyticsBuild,
        }
    }

    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self.kind {
            TaskKind::Ingest { .. } => "ingest",
            TaskKind::StorageUpload { .. } => "storage-upload",
            TaskKind::AnalyticsBuild => "analytics-build",
        }
    }
}

/// Outcome reported by a worker once a task finishes, fails or times out.
///
/// The job record is the source of truth; results are informational.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub job_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub duration: Duration,
}

impl TaskResult {
    pub fn success(job_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            job_id: job_id.into(),
            success: true,
            error: None,
            error_kind: None,
            duration,
        }
    }

    pub fn failure(
        job_id: impl Into<String>,
        kind: ErrorKind,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            success: false,
            error: Some(error.into()),
            error_kind: Some(kind),
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_labels() {
        let task = Task::ingest("j1", "ta_week.csv", IngestSource::Object("ta_week.csv".into()));
        assert_eq!(task.label(), "ingest");
        assert_eq!(Task::analytics_build("j2").label(), "analytics-build");
    }

    #[test]
    fn test_failure_result_carries_kind() {
        let result = TaskResult::failure("j1", ErrorKind::Timeout, "too slow", Duration::from_secs(1));
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(result.error.as_deref(), Some("too slow"));
    }
}
