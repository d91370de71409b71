//! Job repository: CRUD and guarded status transitions for the `jobs` table.
//!
//! Every status change is a conditional `UPDATE … WHERE status = ?`, so a
//! late writer (a timed-out task finishing after the worker gave up on it)
//! can never move a job out of a terminal state.

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::Serialize;

use super::{Database, DatabaseError};
use crate::error::ErrorKind;
use crate::job::{IngestionType, JobStatus};

/// A job row from the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub file_hash: String,
    pub ingestion_type: IngestionType,
    pub status: JobStatus,
    pub table_name: Option<String>,
    pub inserted_count: Option<i64>,
    pub file_names: Option<String>,
    pub file_count: Option<i64>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub retry_count: i64,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl JobRecord {
    /// A fresh `pending` job.
    pub fn new_pending(ingestion_type: IngestionType, file_hash: impl Into<String>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            file_hash: file_hash.into(),
            ingestion_type,
            status: JobStatus::Pending,
            table_name: None,
            inserted_count: None,
            file_names: None,
            file_count: None,
            message: Some("Queued".to_string()),
            error: None,
            error_kind: None,
            retry_count: 0,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
        }
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let error_kind: Option<String> = row.get("error_kind")?;
        Ok(Self {
            id: row.get("id")?,
            file_hash: row.get("file_hash")?,
            ingestion_type: row.get("ingestion_type")?,
            status: row.get("status")?,
            table_name: row.get("table_name")?,
            inserted_count: row.get("inserted_count")?,
            file_names: row.get("file_names")?,
            file_count: row.get("file_count")?,
            message: row.get("message")?,
            error: row.get("error")?,
            error_kind: error_kind.as_deref().and_then(ErrorKind::parse),
            retry_count: row.get("retry_count")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }
}

/// Result fields written when a job completes.
#[derive(Debug, Default, Clone)]
pub struct JobOutcome {
    pub table_name: Option<String>,
    pub inserted_count: Option<i64>,
    pub file_names: Option<String>,
    pub file_count: Option<i64>,
    pub message: Option<String>,
}

/// Stores one name as-is and several as a JSON array.
pub fn encode_file_names(names: &[String]) -> Option<String> {
    match names {
        [] => None,
        [single] => Some(single.clone()),
        many => serde_json::to_string(many).ok(),
    }
}

/// Sort order for job listings.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum JobOrdering {
    #[default]
    NewestFirst,
    OldestFirst,
    RecentlyUpdated,
    Status,
}

impl JobOrdering {
    /// Parses the `ordering` query parameter (`-created_at`, `created_at`,
    /// `-updated_at`, `status`).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "-created_at" => Some(JobOrdering::NewestFirst),
            "created_at" => Some(JobOrdering::OldestFirst),
            "-updated_at" | "updated_at" => Some(JobOrdering::RecentlyUpdated),
            "status" => Some(JobOrdering::Status),
            _ => None,
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            JobOrdering::NewestFirst => "created_at DESC",
            JobOrdering::OldestFirst => "created_at ASC",
            JobOrdering::RecentlyUpdated => "updated_at DESC",
            JobOrdering::Status => "status ASC, created_at DESC",
        }
    }
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub ingestion_type: Option<IngestionType>,
    pub file_hash: Option<String>,
    /// Substring match over file hash, table name and message.
    pub search: Option<String>,
    pub ordering: JobOrdering,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRecord) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, file_hash, ingestion_type, status, table_name, inserted_count,
             file_names, file_count, message, error, error_kind, retry_count, created_at,
             updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                job.id,
                job.file_hash,
                job.ingestion_type,
                job.status,
                job.table_name,
                job.inserted_count,
                job.file_names,
                job.file_count,
                job.message,
                job.error,
                job.error_kind.map(|k| k.as_str()),
                job.retry_count,
                job.created_at,
                job.updated_at,
                job.completed_at,
            ],
        )?;
        Ok(())
    })?;
    log::info!(
        "Job {} created ({}, status {})",
        job.id,
        job.ingestion_type,
        job.status
    );
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRecord::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRecord>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push(format!("status = ?{}", param_values.len() + 1));
            param_values.push(Box::new(status));
        }
        if let Some(ingestion_type) = filter.ingestion_type {
            conditions.push(format!("ingestion_type = ?{}", param_values.len() + 1));
            param_values.push(Box::new(ingestion_type));
        }
        if let Some(ref file_hash) = filter.file_hash {
            conditions.push(format!("file_hash = ?{}", param_values.len() + 1));
            param_values.push(Box::new(file_hash.clone()));
        }
        if let Some(ref search) = filter.search {
            let n = param_values.len() + 1;
            conditions.push(format!(
                "(file_hash LIKE ?{n} OR table_name LIKE ?{n} OR message LIKE ?{n})"
            ));
            param_values.push(Box::new(format!("%{}%", search)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY {} LIMIT ?{} OFFSET ?{}",
            where_clause,
            filter.ordering.sql(),
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRecord> = stmt
            .query_map(params_ref.as_slice(), JobRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: JobStatus) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// The duplicate check: the most recent completed job holding this content
/// hash within the type's duplicate family, if there is one.
pub fn has_successful_job(
    db: &Database,
    file_hash: &str,
    ingestion_type: IngestionType,
) -> Result<Option<JobRecord>, DatabaseError> {
    let family = ingestion_type.duplicate_family();
    if family.is_empty() {
        return Ok(None);
    }
    db.with_conn(|conn| {
        let placeholders: Vec<String> = (0..family.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            "SELECT * FROM jobs WHERE file_hash = ?1 AND status = ?2 AND ingestion_type IN ({})
             ORDER BY created_at DESC LIMIT 1",
            placeholders.join(", ")
        );
        let mut values: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
            Box::new(file_hash.to_string()),
            Box::new(JobStatus::Completed),
        ];
        values.extend(
            family
                .iter()
                .map(|t| Box::new(*t) as Box<dyn rusqlite::types::ToSql>),
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params_from_iter(values.iter()), JobRecord::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Moves a pending job to `processing`. Returns `false` if the job was not pending.
pub fn mark_processing(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE jobs SET status = ?2, message = ?3, updated_at = ?4
             WHERE id = ?1 AND status = ?5",
            params![
                id,
                JobStatus::Processing,
                "Processing",
                now,
                JobStatus::Pending
            ],
        )?)
    })?;
    log_transition(id, changed, JobStatus::Processing);
    Ok(changed == 1)
}

/// Moves a processing job to `completed` with its result fields.
/// Returns `false` if the job was not processing.
pub fn mark_completed(db: &Database, id: &str, outcome: &JobOutcome) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| complete_in(conn, id, outcome))
}

/// [`mark_completed`] on a caller-held connection, so the status change can
/// commit in the same transaction as the rows it reports.
pub fn complete_in(conn: &Connection, id: &str, outcome: &JobOutcome) -> Result<bool, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(
        "UPDATE jobs SET status = ?2, table_name = COALESCE(?3, table_name),
         inserted_count = ?4, file_names = COALESCE(?5, file_names),
         file_count = COALESCE(?6, file_count), message = ?7, error = NULL,
         error_kind = NULL, updated_at = ?8, completed_at = ?8
         WHERE id = ?1 AND status = ?9",
        params![
            id,
            JobStatus::Completed,
            outcome.table_name,
            outcome.inserted_count,
            outcome.file_names,
            outcome.file_count,
            outcome.message,
            now,
            JobStatus::Processing
        ],
    )?;
    log_transition(id, changed, JobStatus::Completed);
    Ok(changed == 1)
}

/// Moves a pending or processing job to `failed`.
/// Returns `false` if the job was already terminal (or does not exist).
pub fn mark_failed(
    db: &Database,
    id: &str,
    kind: ErrorKind,
    error: &str,
) -> Result<bool, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE jobs SET status = ?2, error = ?3, error_kind = ?4, message = ?5,
             updated_at = ?6, completed_at = ?6
             WHERE id = ?1 AND status IN (?7, ?8)",
            params![
                id,
                JobStatus::Failed,
                error,
                kind.as_str(),
                format!("Failed: {}", kind),
                now,
                JobStatus::Pending,
                JobStatus::Processing
            ],
        )?)
    })?;
    log_transition(id, changed, JobStatus::Failed);
    Ok(changed == 1)
}

/// Records one more write retry on a processing job.
pub fn increment_retry(db: &Database, id: &str, message: &str) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET retry_count = retry_count + 1, message = ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, message, now],
        )?;
        Ok(())
    })
}

/// Deletes a job. Returns `false` when no such job exists.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    let changed =
        db.with_conn(|conn| Ok(conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?))?;
    if changed == 1 {
        log::info!("Job {} deleted", id);
    }
    Ok(changed == 1)
}

/// Fails every job still pending or processing. Used at startup, when no
/// task from a previous process can still be running.
pub fn fail_unfinished(db: &Database, kind: ErrorKind, error: &str) -> Result<usize, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    let changed = db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE jobs SET status = ?1, error = ?2, error_kind = ?3, message = ?4,
             updated_at = ?5, completed_at = ?5
             WHERE status IN (?6, ?7)",
            params![
                JobStatus::Failed,
                error,
                kind.as_str(),
                format!("Failed: {}", kind),
                now,
                JobStatus::Pending,
                JobStatus::Processing
            ],
        )?)
    })?;
    if changed > 0 {
        log::warn!("Marked {} unfinished job(s) as failed: {}", changed, error);
    }
    Ok(changed)
}

/// Distinct destination tables of completed table-load jobs.
pub fn completed_table_names(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT table_name FROM jobs
             WHERE status = ?1 AND ingestion_type IN (?2, ?3) AND table_name IS NOT NULL
             ORDER BY table_name",
        )?;
        let names = stmt
            .query_map(
                params![
                    JobStatus::Completed,
                    IngestionType::DatabaseUpload,
                    IngestionType::DatabaseFromS3
                ],
                |r| r.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    })
}

fn log_transition(id: &str, changed: usize, to: JobStatus) {
    if changed == 1 {
        log::info!("Job {} status changed to {}", id, to);
    } else {
        log::debug!("Job {} not moved to {} (state guard)", id, to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(hash: &str) -> JobRecord {
        JobRecord::new_pending(IngestionType::DatabaseUpload, hash)
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        let job = sample_job("h1");
        insert(&db, &job).unwrap();

        let found = find_by_id(&db, &job.id).unwrap().unwrap();
        assert_eq!(found.file_hash, "h1");
        assert_eq!(found.status, JobStatus::Pending);
        assert_eq!(found.ingestion_type, IngestionType::DatabaseUpload);
        assert_eq!(found.retry_count, 0);
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_full_lifecycle() {
        let db = test_db();
        let job = sample_job("h2");
        insert(&db, &job).unwrap();

        assert!(mark_processing(&db, &job.id).unwrap());
        let outcome = JobOutcome {
            table_name: Some("sales".to_string()),
            inserted_count: Some(42),
            message: Some("Loaded 42 rows".to_string()),
            ..Default::default()
        };
        assert!(mark_completed(&db, &job.id, &outcome).unwrap());

        let found = find_by_id(&db, &job.id).unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Completed);
        assert_eq!(found.table_name.as_deref(), Some("sales"));
        assert_eq!(found.inserted_count, Some(42));
        assert!(found.completed_at.is_some());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let db = test_db();
        let job = sample_job("h3");
        insert(&db, &job).unwrap();
        mark_processing(&db, &job.id).unwrap();
        assert!(mark_failed(&db, &job.id, ErrorKind::Timeout, "took too long").unwrap());

        // A late completion must not overwrite the failure.
        assert!(!mark_completed(&db, &job.id, &JobOutcome::default()).unwrap());
        assert!(!mark_processing(&db, &job.id).unwrap());
        assert!(!mark_failed(&db, &job.id, ErrorKind::ParseError, "again").unwrap());

        let found = find_by_id(&db, &job.id).unwrap().unwrap();
        assert_eq!(found.status, JobStatus::Failed);
        assert_eq!(found.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(found.error.as_deref(), Some("took too long"));
    }

    #[test]
    fn test_pending_cannot_complete() {
        let db = test_db();
        let job = sample_job("h4");
        insert(&db, &job).unwrap();
        assert!(!mark_completed(&db, &job.id, &JobOutcome::default()).unwrap());
        assert_eq!(
            find_by_id(&db, &job.id).unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[test]
    fn test_has_successful_job_only_counts_completed() {
        let db = test_db();
        let job = sample_job("same-hash");
        insert(&db, &job).unwrap();
        assert!(has_successful_job(&db, "same-hash", IngestionType::DatabaseUpload).unwrap().is_none());

        mark_processing(&db, &job.id).unwrap();
        mark_completed(&db, &job.id, &JobOutcome::default()).unwrap();

        let existing = has_successful_job(&db, "same-hash", IngestionType::DatabaseUpload).unwrap();
        assert_eq!(existing.map(|j| j.id), Some(job.id.clone()));
        assert!(has_successful_job(&db, "same-hash", IngestionType::DatabaseFromS3).unwrap().is_some());
        assert!(has_successful_job(&db, "same-hash", IngestionType::S3Upload).unwrap().is_none());
        assert!(has_successful_job(&db, "other-hash", IngestionType::DatabaseUpload).unwrap().is_none());
    }

    #[test]
    fn test_query_with_filters() {
        let db = test_db();
        insert(&db, &sample_job("a")).unwrap();
        let mut upload = JobRecord::new_pending(IngestionType::S3Upload, "b");
        upload.message = Some("bucket copy".to_string());
        insert(&db, &upload).unwrap();

        let (rows, total) = query(
            &db,
            &JobFilter {
                ingestion_type: Some(IngestionType::S3Upload),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].id, upload.id);

        let (rows, total) = query(
            &db,
            &JobFilter {
                search: Some("bucket".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].file_hash, "b");

        let (_, total) = query(
            &db,
            &JobFilter {
                status: Some(JobStatus::Pending),
                file_hash: Some("a".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_query_pagination_and_ordering() {
        let db = test_db();
        for i in 0..10 {
            let mut job = sample_job(&format!("p{}", i));
            job.created_at = format!("2026-01-{:02}T00:00:00+00:00", i + 1);
            insert(&db, &job).unwrap();
        }

        let (rows, total) = query(
            &db,
            &JobFilter {
                limit: Some(3),
                offset: Some(0),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(total, 10);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].file_hash, "p9");

        let (rows, _) = query(
            &db,
            &JobFilter {
                ordering: JobOrdering::OldestFirst,
                limit: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(rows[0].file_hash, "p0");
    }

    #[test]
    fn test_count_and_fail_unfinished() {
        let db = test_db();
        let a = sample_job("c1");
        let b = sample_job("c2");
        let c = sample_job("c3");
        for job in [&a, &b, &c] {
            insert(&db, job).unwrap();
        }
        mark_processing(&db, &b.id).unwrap();
        mark_processing(&db, &c.id).unwrap();
        mark_completed(&db, &c.id, &JobOutcome::default()).unwrap();

        assert_eq!(count_by_status(&db, JobStatus::Pending).unwrap(), 1);
        assert_eq!(count_by_status(&db, JobStatus::Processing).unwrap(), 1);

        let failed = fail_unfinished(&db, ErrorKind::Timeout, "interrupted").unwrap();
        assert_eq!(failed, 2);
        assert_eq!(count_by_status(&db, JobStatus::Failed).unwrap(), 2);
        assert_eq!(count_by_status(&db, JobStatus::Completed).unwrap(), 1);
    }

    #[test]
    fn test_increment_retry_and_delete() {
        let db = test_db();
        let job = sample_job("r1");
        insert(&db, &job).unwrap();
        increment_retry(&db, &job.id, "Retry 1/3").unwrap();
        increment_retry(&db, &job.id, "Retry 2/3").unwrap();

        let found = find_by_id(&db, &job.id).unwrap().unwrap();
        assert_eq!(found.retry_count, 2);
        assert_eq!(found.message.as_deref(), Some("Retry 2/3"));

        assert!(delete(&db, &job.id).unwrap());
        assert!(!delete(&db, &job.id).unwrap());
    }

    #[test]
    fn test_completed_table_names() {
        let db = test_db();
        for (hash, table) in [("t1", "ta_march"), ("t2", "ta_april"), ("t3", "ta_march")] {
            let job = sample_job(hash);
            insert(&db, &job).unwrap();
            mark_processing(&db, &job.id).unwrap();
            mark_completed(
                &db,
                &job.id,
                &JobOutcome {
                    table_name: Some(table.to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        }
        assert_eq!(
            completed_table_names(&db).unwrap(),
            vec!["ta_april".to_string(), "ta_march".to_string()]
        );
    }

    #[test]
    fn test_file_names_encoding() {
        assert_eq!(encode_file_names(&[]), None);
        let one = vec!["a.csv".to_string()];
        assert_eq!(encode_file_names(&one).as_deref(), Some("a.csv"));

        let many = vec!["x/a.csv".to_string(), "x/b.csv".to_string()];
        let encoded = encode_file_names(&many).unwrap();
        assert_eq!(encoded, r#"["x/a.csv","x/b.csv"]"#);
    }

    #[test]
    fn test_complete_in_rolls_back_with_transaction() {
        let db = test_db();
        let job = sample_job("h-tx");
        insert(&db, &job).unwrap();
        mark_processing(&db, &job.id).unwrap();

        let result: Result<(), DatabaseError> = db.with_transaction(|tx| {
            assert!(complete_in(tx, &job.id, &JobOutcome::default())?);
            Err(DatabaseError::Aborted("test".into()))
        });
        assert!(result.is_err());
        assert_eq!(
            find_by_id(&db, &job.id).unwrap().unwrap().status,
            JobStatus::Processing
        );
    }
}
