//! Service facade used by the HTTP layer and the management commands.
//!
//! Submissions create a `pending` job, queue a task and return at once;
//! the worker pool moves the job through its lifecycle.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::analytics::AnalyticsSummary;
use crate::config::Config;
use crate::db::job_repo::{self, JobFilter, JobRecord};
use crate::db::table_repo::{self, TablePage, TableQuery};
use crate::db::{Database, DatabaseError};
use crate::error::{ConfigError, ErrorKind, Result, SheetloadError, StorageError};
use crate::job::{IngestionType, JobStatus};
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::sanitize;
use crate::storage::{
    normalize_relative_path, sha256_hex, FilesystemBucket, ObjectStore, UploadPayload,
};
use crate::worker::{IngestSource, Task, WorkerPool};

/// Error recorded on jobs left unfinished by a previous process.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Reply to a submission: the new job, or the earlier one for duplicate content.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub job_id: String,
    pub message: String,
    pub file_hash: String,
    pub status: JobStatus,
    pub ingestion_type: IngestionType,
    pub is_duplicate: bool,
}

impl IngestResponse {
    pub fn accepted(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.clone(),
            message: job.message.clone().unwrap_or_default(),
            file_hash: job.file_hash.clone(),
            status: job.status,
            ingestion_type: job.ingestion_type,
            is_duplicate: false,
        }
    }

    pub fn duplicate(job: &JobRecord) -> Self {
        Self {
            job_id: job.id.clone(),
            message: format!(
                "Content already ingested successfully by job {}. Status: {}",
                job.id, job.status
            ),
            file_hash: job.file_hash.clone(),
            status: job.status,
            ingestion_type: job.ingestion_type,
            is_duplicate: true,
        }
    }
}

/// Read-only view of a job for status polling.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub ingestion_type: IngestionType,
    pub message: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub inserted_count: Option<i64>,
    pub table_name: Option<String>,
    pub file_size: Option<String>,
    pub file_name: Option<String>,
    pub file_names: Option<Vec<String>>,
    pub file_count: Option<i64>,
    pub retry_count: i64,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl StatusResponse {
    pub fn from_job(job: JobRecord) -> Self {
        // Several names are stored as a JSON array, one name as plain text.
        let (file_name, file_names) = match job.file_names.as_deref() {
            Some(raw) => match serde_json::from_str::<Vec<String>>(raw) {
                Ok(names) => (None, Some(names)),
                Err(_) => (Some(raw.to_string()), None),
            },
            None => (None, None),
        };

        // Storage uploads record bytes written; table loads record rows.
        let file_size = match (job.ingestion_type, job.inserted_count) {
            (IngestionType::S3Upload, Some(bytes)) if bytes > 0 => {
                Some(format_file_size(bytes as u64))
            }
            _ => None,
        };

        let error = match (job.status, job.error) {
            (JobStatus::Failed, None) => Some("Job failed without an error message".to_string()),
            (_, error) => error,
        };

        Self {
            job_id: job.id,
            status: job.status,
            ingestion_type: job.ingestion_type,
            message: job.message,
            error,
            error_kind: job.error_kind,
            inserted_count: job.inserted_count,
            table_name: job.table_name,
            file_size,
            file_name,
            file_names,
            file_count: job.file_count,
            retry_count: job.retry_count,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

/// `512 B`, `1.5 KB`, `2.0 MB`.
pub fn format_file_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < MB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub count: u64,
    pub results: Vec<JobRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableInfo {
    pub table_name: String,
    pub schema_name: String,
}

pub struct IngestService {
    config: Config,
    db: Database,
    store: Arc<dyn ObjectStore>,
    pipeline: Arc<Pipeline>,
    pool: WorkerPool,
}

impl IngestService {
    /// Opens the configured database and bucket and starts the workers.
    pub fn open(config: Config) -> Result<Self> {
        let db_path = config
            .resolved_database_path()
            .ok_or_else(|| ConfigError::Validation {
                message: "Could not determine database path (no home directory)".to_string(),
            })?;
        let bucket_dir = config
            .resolved_bucket_directory()
            .ok_or_else(|| ConfigError::Validation {
                message: "Could not determine bucket directory".to_string(),
            })?;

        let db = Database::open(&db_path)?;
        let store = Arc::new(FilesystemBucket::new(config.bucket_name.clone(), bucket_dir)?);
        Self::with_parts(config, db, store)
    }

    /// Builds the service on an existing database and store.
    ///
    /// Jobs still `pending` or `processing` belong to a process that is gone
    /// and are failed before any worker starts.
    pub fn with_parts(config: Config, db: Database, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let interrupted = job_repo::fail_unfinished(&db, ErrorKind::Timeout, INTERRUPTED_BY_RESTART)?;
        if interrupted > 0 {
            warn!(count = interrupted, "Failed jobs interrupted by a restart");
        }

        let pipeline_config = Arc::new(PipelineConfig::from_config(&config));
        let pipeline = Arc::new(Pipeline::new(pipeline_config, db.clone(), Arc::clone(&store))?);
        let pool = WorkerPool::new(
            pipeline.clone(),
            db.clone(),
            config.worker_count,
            Duration::from_secs(config.task_timeout_secs),
        )?;

        Ok(Self {
            config,
            db,
            store,
            pipeline,
            pool,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// Queues a file received in the request for loading into a table.
    pub fn submit_upload(&self, filename: &str, content: Vec<u8>) -> Result<JobRecord> {
        let name = sanitize::redact_name(filename);
        if name.trim().is_empty() || name == "<unknown>" {
            return Err(SheetloadError::InvalidRequest("No file provided".to_string()));
        }
        if content.is_empty() {
            return Err(SheetloadError::InvalidRequest(format!("File '{}' is empty", name)));
        }

        let file_hash = sha256_hex(&content);
        self.reject_duplicate(&file_hash, IngestionType::DatabaseUpload)?;

        let mut job = JobRecord::new_pending(IngestionType::DatabaseUpload, file_hash);
        job.file_names = Some(name.clone());
        job.file_count = Some(1);
        job.message = Some("Database ingestion started".to_string());

        let task = Task::ingest(&job.id, name, IngestSource::Bytes(content));
        self.enqueue(job, task)
    }

    /// Queues an object already in the bucket for loading into a table.
    pub fn submit_from_storage(&self, key: &str) -> Result<JobRecord> {
        let key = normalize_relative_path(key).map_err(invalid_request)?;
        let meta = self.store.head(&key)?.ok_or_else(|| StorageError::NotFound {
            bucket: self.store.bucket().to_string(),
            key: key.clone(),
        })?;

        debug!(
            size = meta.size,
            content_type = %meta.content_type,
            "Found object in bucket"
        );
        self.reject_duplicate(&meta.sha256, IngestionType::DatabaseFromS3)?;

        let name = sanitize::redact_name(&key);
        let mut job = JobRecord::new_pending(IngestionType::DatabaseFromS3, meta.sha256);
        job.file_names = Some(name.clone());
        job.file_count = Some(1);
        job.message = Some(format!("Database ingestion started from bucket: {}", key));

        let task = Task::ingest(&job.id, name, IngestSource::Object(key));
        self.enqueue(job, task)
    }

    /// Queues one or more files to be written into the bucket.
    pub fn upload_to_storage(
        &self,
        files: Vec<(String, Vec<u8>)>,
        preserve_filename: bool,
    ) -> Result<JobRecord> {
        let payload = UploadPayload::from_files(files).map_err(invalid_request)?;
        let file_hash = payload.content_hash()?;
        self.reject_duplicate(&file_hash, IngestionType::S3Upload)?;

        let names = payload.file_names();
        let mut job = JobRecord::new_pending(IngestionType::S3Upload, file_hash);
        job.file_names = job_repo::encode_file_names(&names);
        job.file_count = Some(names.len() as i64);
        job.message = Some(format!("Upload of {} file(s) started", names.len()));

        let task = Task::storage_upload(&job.id, payload, preserve_filename);
        self.enqueue(job, task)
    }

    pub fn job_status(&self, job_id: &str) -> Result<StatusResponse> {
        self.get_job(job_id).map(StatusResponse::from_job)
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        job_repo::find_by_id(&self.db, job_id)?
            .ok_or_else(|| SheetloadError::NotFound(format!("Job {} not found", job_id)))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        let (results, count) = job_repo::query(&self.db, filter)?;
        Ok(JobPage { count, results })
    }

    pub fn delete_job(&self, job_id: &str) -> Result<()> {
        if job_repo::delete(&self.db, job_id)? {
            Ok(())
        } else {
            Err(SheetloadError::NotFound(format!("Job {} not found", job_id)))
        }
    }

    /// Rebuilds the analytics tables on the calling thread.
    pub fn build_analytics_sync(&self) -> Result<AnalyticsSummary> {
        let summary = self
            .pipeline
            .analytics()
            .build(&self.db, &AtomicBool::new(false))?;
        info!("{}", self.pipeline.summary_message(&summary));
        Ok(summary)
    }

    /// Queues an analytics rebuild; the job id is the task handle.
    pub fn build_analytics_async(&self) -> Result<JobRecord> {
        let mut job = JobRecord::new_pending(IngestionType::AnalyticsBuild, "");
        job.message = Some("Analytics build started in background".to_string());
        let task = Task::analytics_build(&job.id);
        self.enqueue(job, task)
    }

    pub fn list_tables(&self) -> Result<Vec<TableInfo>> {
        Ok(table_repo::list_tables(&self.db)?
            .into_iter()
            .map(|table_name| TableInfo {
                table_name,
                schema_name: "main".to_string(),
            })
            .collect())
    }

    pub fn table_data(&self, table: &str, query: &TableQuery) -> Result<TablePage> {
        if table_repo::validate_name(table).is_err() {
            return Err(SheetloadError::InvalidRequest("Invalid table name".to_string()));
        }
        for (column, _) in &query.filters {
            if table_repo::validate_name(column).is_err() {
                return Err(SheetloadError::InvalidRequest(format!(
                    "Invalid filter column: {}",
                    column
                )));
            }
        }

        match table_repo::table_data(&self.db, table, query) {
            Ok(Some(page)) => Ok(page),
            Ok(None) => Err(SheetloadError::NotFound(format!(
                "Table {} not found or has no columns",
                table
            ))),
            Err(DatabaseError::InvalidIdentifier(column)) => Err(SheetloadError::InvalidRequest(
                format!("Filter column does not exist on table: {}", column),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Polls a job until it is terminal or `timeout` passes; returns the
    /// latest record either way.
    pub fn wait_for_job(&self, job_id: &str, timeout: Duration) -> Result<JobRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.get_job(job_id)?;
            if job.status.is_terminal() || Instant::now() >= deadline {
                return Ok(job);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Stops taking tasks, lets running tasks finish and joins the workers.
    pub fn shutdown(self) {
        self.pool.shutdown();
        self.pool.wait();
    }

    fn reject_duplicate(&self, file_hash: &str, ingestion_type: IngestionType) -> Result<()> {
        if let Some(existing) = job_repo::has_successful_job(&self.db, file_hash, ingestion_type)? {
            info!(
                job_id = %existing.id,
                file_hash = sanitize::short_hash(file_hash),
                "Duplicate submission"
            );
            return Err(SheetloadError::Duplicate(Box::new(existing)));
        }
        Ok(())
    }

    /// Persists the job, then queues its task. A job whose task cannot be
    /// queued is failed straight away so it never sits in `pending`.
    fn enqueue(&self, job: JobRecord, task: Task) -> Result<JobRecord> {
        job_repo::insert(&self.db, &job)?;

        if let Err(e) = self.pool.submit(task) {
            let message = format!("Could not queue task: {}", e);
            job_repo::mark_failed(&self.db, &job.id, ErrorKind::Internal, &message)?;
            return Err(e.into());
        }

        info!(
            job_id = %job.id,
            ingestion_type = %job.ingestion_type,
            file_hash = sanitize::short_hash(&job.file_hash),
            "Job queued"
        );
        Ok(job)
    }
}

fn invalid_request(e: StorageError) -> SheetloadError {
    SheetloadError::InvalidRequest(e.to_string())
}
