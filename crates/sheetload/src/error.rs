use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::job_repo::JobRecord;

#[derive(Error, Debug)]
pub enum SheetloadError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Content already ingested by job {}", .0.id)]
    Duplicate(Box<JobRecord>),
}

impl SheetloadError {
    /// Classifies the error for API responses and job records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SheetloadError::Parse(ParseError::UnsupportedFormat(_)) => ErrorKind::UnsupportedFormat,
            SheetloadError::Parse(_) => ErrorKind::ParseError,
            SheetloadError::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            SheetloadError::Storage(_) => ErrorKind::StorageError,
            SheetloadError::Database(_) => ErrorKind::DatabaseError,
            SheetloadError::NotFound(_) => ErrorKind::NotFound,
            SheetloadError::Duplicate(_) => ErrorKind::DuplicateSubmission,
            SheetloadError::Config(_)
            | SheetloadError::Worker(_)
            | SheetloadError::InvalidRequest(_) => ErrorKind::Internal,
        }
    }
}

/// Failure classification persisted on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    UnsupportedFormat,
    ParseError,
    StorageError,
    DatabaseError,
    Timeout,
    DuplicateSubmission,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::UnsupportedFormat => "unsupported_format",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::StorageError => "storage_error",
            ErrorKind::DatabaseError => "database_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::DuplicateSubmission => "duplicate_submission",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "not_found" => ErrorKind::NotFound,
            "unsupported_format" => ErrorKind::UnsupportedFormat,
            "parse_error" => ErrorKind::ParseError,
            "storage_error" => ErrorKind::StorageError,
            "database_error" => ErrorKind::DatabaseError,
            "timeout" => ErrorKind::Timeout,
            "duplicate_submission" => ErrorKind::DuplicateSubmission,
            "internal" => ErrorKind::Internal,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid handler '{id}': {reason}")]
    InvalidHandler { id: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to read spreadsheet: {0}")]
    Spreadsheet(String),

    #[error("Failed to read delimited text: {0}")]
    Delimited(String),

    #[error("Worksheet not found: {0}")]
    SheetNotFound(String),

    #[error("File '{0}' contains no header row")]
    MissingHeader(String),

    #[error("Header row {row} is beyond the end of '{filename}'")]
    HeaderOutOfRange { filename: String, row: usize },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object '{key}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, key: String },

    #[error("Invalid upload payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid object path: {0}")]
    InvalidPath(String),

    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read object '{key}': {source}")]
    ReadObject {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write object '{key}': {source}")]
    WriteObject {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Integrity check failed for '{key}': {reason}")]
    IntegrityCheck { key: String, reason: String },

    #[error("Failed to read archive: {0}")]
    Archive(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Job {0} is already queued or running")]
    AlreadyInFlight(String),

    #[error("Task queue is full")]
    QueueFull,
}

pub type Result<T> = std::result::Result<T, SheetloadError>;
