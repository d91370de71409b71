//! Service harness for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use sheetload::db::table_repo::{self, TablePage, TableQuery};
use sheetload::{Config, Database, FilesystemBucket, IngestService, JobRecord};

/// Upper bound for a test job to reach a terminal state.
pub const JOB_WAIT: Duration = Duration::from_secs(15);

pub struct TestService {
    /// Keeps the bucket directory alive for the service's lifetime.
    temp_dir: TempDir,
    pub db: Database,
    pub store: Arc<FilesystemBucket>,
    pub service: IngestService,
}

impl TestService {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_database(config, Database::open_in_memory().expect("in-memory database"))
    }

    /// Starts a service on an existing database, as a restarted process would.
    pub fn with_database(config: Config, db: Database) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = Arc::new(
            FilesystemBucket::new("uploads", temp_dir.path().join("bucket"))
                .expect("Failed to create bucket"),
        );
        let service = IngestService::with_parts(config, db.clone(), store.clone())
            .expect("Failed to start service");

        Self {
            temp_dir,
            db,
            store,
            service,
        }
    }

    /// Submits an upload and waits for the job to finish.
    pub fn ingest(&self, filename: &str, content: Vec<u8>) -> JobRecord {
        let job = self
            .service
            .submit_upload(filename, content)
            .expect("submission accepted");
        self.wait(&job.id)
    }

    pub fn wait(&self, job_id: &str) -> JobRecord {
        let job = self
            .service
            .wait_for_job(job_id, JOB_WAIT)
            .expect("job exists");
        assert!(
            job.status.is_terminal(),
            "job {} still {} after {:?}",
            job_id,
            job.status,
            JOB_WAIT
        );
        job
    }

    pub fn table(&self, name: &str) -> Option<TablePage> {
        let query = TableQuery {
            limit: Some(table_repo::MAX_PAGE_SIZE),
            ..TableQuery::default()
        };
        table_repo::table_data(&self.db, name, &query).expect("table query")
    }

    pub fn row_count(&self, name: &str) -> u64 {
        self.table(name).map(|page| page.total_rows).unwrap_or(0)
    }
}

pub fn test_config() -> Config {
    Config {
        worker_count: 2,
        task_timeout_secs: 30,
        retry_backoff_ms: 10,
        ..Config::default()
    }
}
