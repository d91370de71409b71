pub mod analytics;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod job;
pub mod parser;
pub mod pipeline;
pub mod sanitize;
pub mod service;
pub mod storage;
pub mod worker;

pub use analytics::{AnalyticsBuilder, AnalyticsSummary};
pub use config::{load_config, Config};
pub use db::job_repo::{JobFilter, JobOrdering, JobRecord};
pub use db::table_repo::{TablePage, TableQuery};
pub use db::{Database, DatabaseError};
pub use error::{
    ConfigError, ErrorKind, ParseError, Result, SheetloadError, StorageError, WorkerError,
};
pub use job::{IngestionType, JobStatus};
pub use pipeline::{IngestError, Pipeline, PipelineConfig};
pub use service::{IngestResponse, IngestService, JobPage, StatusResponse, TableInfo};
pub use storage::{FilesystemBucket, ObjectStore, UploadPayload};
pub use worker::{Task, TaskResult, WorkerPool};
