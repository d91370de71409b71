//! Job lifecycle vocabulary shared by the store, the workers and the API.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// Jobs move `pending → processing → {completed, failed}`. A pending job may
/// also fail directly (e.g. it timed out before a worker picked it up), but
/// nothing ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does with its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestionType {
    /// File uploaded in the request body, loaded into a table.
    DatabaseUpload,
    /// File fetched from the bucket, loaded into a table.
    DatabaseFromS3,
    /// Raw file(s) copied into the bucket, no table load.
    S3Upload,
    /// Analytics tables rebuilt in the background.
    AnalyticsBuild,
}

impl IngestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionType::DatabaseUpload => "database-upload",
            IngestionType::DatabaseFromS3 => "database-from-s3",
            IngestionType::S3Upload => "s3-upload",
            IngestionType::AnalyticsBuild => "analytics-build",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "database-upload" => Some(IngestionType::DatabaseUpload),
            "database-from-s3" => Some(IngestionType::DatabaseFromS3),
            "s3-upload" => Some(IngestionType::S3Upload),
            "analytics-build" => Some(IngestionType::AnalyticsBuild),
            _ => None,
        }
    }

    /// Types whose successful jobs count as "already ingested" for this one.
    ///
    /// Both table-load paths end in the same table, so content loaded via a
    /// direct upload is a duplicate when later submitted from the bucket.
    pub fn duplicate_family(&self) -> &'static [IngestionType] {
        match self {
            IngestionType::DatabaseUpload | IngestionType::DatabaseFromS3 => {
                &[IngestionType::DatabaseUpload, IngestionType::DatabaseFromS3]
            }
            IngestionType::S3Upload => &[IngestionType::S3Upload],
            IngestionType::AnalyticsBuild => &[],
        }
    }

    /// Whether jobs of this type write rows into a destination table.
    pub fn loads_table(&self) -> bool {
        matches!(
            self,
            IngestionType::DatabaseUpload | IngestionType::DatabaseFromS3
        )
    }
}

impl fmt::Display for IngestionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        JobStatus::parse(text).ok_or_else(|| FromSqlError::Other(unknown_value("status", text)))
    }
}

impl ToSql for IngestionType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for IngestionType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        IngestionType::parse(text)
            .ok_or_else(|| FromSqlError::Other(unknown_value("ingestion type", text)))
    }
}

fn unknown_value(what: &str, value: &str) -> Box<dyn std::error::Error + Send + Sync> {
    format!("unknown {}: {}", what, value).into()
}
