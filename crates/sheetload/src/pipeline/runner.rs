use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, info_span, warn};

use crate::analytics::{AnalyticsBuilder, AnalyticsSummary};
use crate::config::HandlerRule;
use crate::db::job_repo::{self, JobOutcome};
use crate::db::{table_repo, Database, DatabaseError};
use crate::error::{ConfigError, ParseError};
use crate::handlers::{self, HandlerSet};
use crate::parser::{table_name_from_stem, Grid, ParsedTable, ParserRegistry};
use crate::sanitize;
use crate::storage::{store_payload, ObjectStore, UploadPayload};
use crate::worker::{IngestSource, Task, TaskExecutor, TaskKind, TaskResult};

use super::config::PipelineConfig;
use super::error::IngestError;

/// Executes queued tasks against the database and the bucket.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    db: Database,
    store: Arc<dyn ObjectStore>,
    parsers: ParserRegistry,
    handlers: HandlerSet,
    analytics: AnalyticsBuilder,
}

impl Pipeline {
    pub fn new(
        config: Arc<PipelineConfig>,
        db: Database,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ConfigError> {
        let handlers = HandlerSet::new(config.handlers.clone())?;
        let analytics = AnalyticsBuilder::new(config.analytics.clone())?;
        Ok(Self {
            config,
            db,
            store,
            parsers: ParserRegistry::new(),
            handlers,
            analytics,
        })
    }

    pub fn analytics(&self) -> &AnalyticsBuilder {
        &self.analytics
    }

    /// Runs one task and records its outcome on the job.
    ///
    /// Every failure is caught here and written to the job record; nothing
    /// propagates to the worker pool.
    pub fn run(&self, task: Task, cancel: &AtomicBool) -> TaskResult {
        let started = Instant::now();
        let Task { job_id, kind } = task;

        let outcome = match kind {
            TaskKind::Ingest { filename, source } => {
                self.run_ingest(&job_id, &filename, source, cancel)
            }
            TaskKind::StorageUpload {
                payload,
                preserve_filename,
            } => self.run_storage_upload(&job_id, &payload, preserve_filename, cancel),
            TaskKind::AnalyticsBuild => self.run_analytics(&job_id, cancel),
        };

        match outcome {
            Ok(()) => TaskResult::success(job_id, started.elapsed()),
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                if e.is_recordable() {
                    match job_repo::mark_failed(&self.db, &job_id, kind, &message) {
                        Ok(true) => warn!(job_id = %job_id, error_kind = %kind, "Job failed: {}", message),
                        Ok(false) => debug!(job_id = %job_id, "Job already closed, dropping failure: {}", message),
                        Err(db_err) => error!(job_id = %job_id, "Could not record failure ({}): {}", message, db_err),
                    }
                } else {
                    error!(job_id = %job_id, "Task abandoned: {}", message);
                }
                TaskResult::failure(job_id, kind, message, started.elapsed())
            }
        }
    }

    fn run_ingest(
        &self,
        job_id: &str,
        filename: &str,
        source: IngestSource,
        cancel: &AtomicBool,
    ) -> Result<(), IngestError> {
        let name = sanitize::redact_name(filename);
        let _pipeline_span = info_span!("pipeline",
            job_id = %job_id,
            filename = %name,
            task = "ingest",
        )
        .entered();

        // Step 1: Claim the job
        {
            let _step = info_span!("start").entered();
            self.step_start(job_id)?;
        }

        // Step 2: Fetch the file
        let bytes = {
            let _step = info_span!("fetch_source").entered();
            self.step_fetch(source)?
        };
        check_cancel(cancel, "fetching the file")?;

        let rule = self.handlers.find(&name);
        if let Some(rule) = rule {
            debug!(handler = %rule.id, "Special handler matched");
        }

        // Step 3: Parse
        let grid = {
            let _step = info_span!("parse", bytes = bytes.len()).entered();
            self.parsers
                .parse(&name, &bytes, rule.and_then(|r| r.sheet.as_deref()))?
        };

        // Step 4: Handlers and normalisation
        let table = {
            let _step = info_span!("shape").entered();
            shape_table(grid, &name, rule)?
        };
        check_cancel(cancel, "parsing")?;

        // Step 5: Load and complete in one transaction
        let table_name = self.destination_table(&name, rule)?;
        let inserted = {
            let _step = info_span!("load", table = %table_name, rows = table.rows.len()).entered();
            self.step_load(job_id, &name, &table_name, &table, cancel)?
        };

        info!(table = %table_name, inserted, "Ingestion completed");
        Ok(())
    }

    fn run_storage_upload(
        &self,
        job_id: &str,
        payload: &UploadPayload,
        preserve_filename: bool,
        cancel: &AtomicBool,
    ) -> Result<(), IngestError> {
        let names = payload.file_names();
        let _pipeline_span = info_span!("pipeline",
            job_id = %job_id,
            files = names.len(),
            task = "storage-upload",
        )
        .entered();

        {
            let _step = info_span!("start").entered();
            self.step_start(job_id)?;
        }
        check_cancel(cancel, "starting")?;

        let summary = {
            let _step = info_span!("store_objects").entered();
            store_payload(self.store.as_ref(), payload, preserve_filename)?
        };

        let outcome = JobOutcome {
            table_name: None,
            inserted_count: Some(summary.total_bytes as i64),
            file_names: job_repo::encode_file_names(&summary.keys),
            file_count: Some(summary.keys.len() as i64),
            message: Some(format!(
                "Uploaded {} file(s) to bucket {}",
                summary.keys.len(),
                self.store.bucket()
            )),
        };
        if !job_repo::mark_completed(&self.db, job_id, &outcome)? {
            warn!("Upload finished after job {} was closed", job_id);
        }

        info!(objects = summary.keys.len(), bytes = summary.total_bytes, "Upload completed");
        Ok(())
    }

    fn run_analytics(&self, job_id: &str, cancel: &AtomicBool) -> Result<(), IngestError> {
        let _pipeline_span = info_span!("pipeline", job_id = %job_id, task = "analytics-build").entered();

        {
            let _step = info_span!("start").entered();
            self.step_start(job_id)?;
        }

        let summary = {
            let _step = info_span!("rebuild_tables").entered();
            self.analytics.build(&self.db, cancel)?
        };

        let outcome = JobOutcome {
            table_name: Some(self.config.analytics.combined_table.clone()),
            inserted_count: Some(summary.combined_rows as i64),
            file_names: None,
            file_count: None,
            message: Some(self.summary_message(&summary)),
        };
        if !job_repo::mark_completed(&self.db, job_id, &outcome)? {
            warn!("Analytics finished after job {} was closed", job_id);
        }
        Ok(())
    }

    /// Human-readable result of an analytics rebuild.
    pub fn summary_message(&self, summary: &AnalyticsSummary) -> String {
        format!(
            "Rebuilt {} ({} rows) and {} ({} rows) from {} table(s)",
            self.config.analytics.combined_table,
            summary.combined_rows,
            self.config.analytics.hours_table,
            summary.hours_rows,
            summary.tables_processed.len()
        )
    }

    fn step_start(&self, job_id: &str) -> Result<(), IngestError> {
        let job = job_repo::find_by_id(&self.db, job_id)?
            .ok_or_else(|| IngestError::JobNotFound(job_id.to_string()))?;
        if !job_repo::mark_processing(&self.db, job_id)? {
            return Err(IngestError::NotPending {
                id: job_id.to_string(),
                status: job.status,
            });
        }
        Ok(())
    }

    fn step_fetch(&self, source: IngestSource) -> Result<Vec<u8>, IngestError> {
        match source {
            IngestSource::Bytes(bytes) => Ok(bytes),
            IngestSource::Object(key) => {
                debug!(key = %sanitize::redact_name(&key), "Downloading from bucket");
                Ok(self.store.get(&key)?)
            }
        }
    }

    /// Handler override, else the sanitised file stem.
    ///
    /// A stem that lands on a table the service owns is prefixed with `t_`
    /// until it no longer does. An override naming such a table fails.
    fn destination_table(
        &self,
        filename: &str,
        rule: Option<&HandlerRule>,
    ) -> Result<String, IngestError> {
        if let Some(table) = rule.and_then(|r| r.table.as_deref()) {
            if self.is_reserved(table) {
                return Err(IngestError::ReservedTable(table.to_string()));
            }
            return Ok(table.to_string());
        }

        let stem = Path::new(filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let mut name = table_name_from_stem(stem);
        while self.is_reserved(&name) {
            name = format!("t_{}", name);
        }
        Ok(name)
    }

    fn is_reserved(&self, table: &str) -> bool {
        table_repo::is_internal(table) || self.config.analytics.owns_table(table)
    }

    /// Writes the rows and completes the job in one transaction, retrying
    /// retryable database errors with linear backoff.
    fn step_load(
        &self,
        job_id: &str,
        filename: &str,
        table_name: &str,
        table: &ParsedTable,
        cancel: &AtomicBool,
    ) -> Result<usize, IngestError> {
        let max_retries = self.config.max_write_retries;
        let mut attempt: u32 = 0;

        loop {
            let result = self.db.with_transaction(|tx| {
                let inserted =
                    table_repo::load_rows(tx, table_name, &table.columns, &table.rows, cancel)?;
                let outcome = JobOutcome {
                    table_name: Some(table_name.to_string()),
                    inserted_count: Some(inserted as i64),
                    file_names: Some(filename.to_string()),
                    file_count: Some(1),
                    message: Some(format!("Loaded {} rows into {}", inserted, table_name)),
                };
                if !job_repo::complete_in(tx, job_id, &outcome)? {
                    return Err(DatabaseError::StaleJob(job_id.to_string()));
                }
                Ok(inserted)
            });

            match result {
                Ok(inserted) => return Ok(inserted),
                Err(e)
                    if e.is_retryable()
                        && attempt < max_retries
                        && !cancel.load(Ordering::Relaxed) =>
                {
                    attempt += 1;
                    let delay = self.config.retry_backoff * attempt;
                    warn!(attempt, max_retries, error = %e, "Database write failed, retrying in {}ms", delay.as_millis());
                    job_repo::increment_retry(
                        &self.db,
                        job_id,
                        &format!("Retry {}/{} after database error: {}", attempt, max_retries, e),
                    )?;
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl TaskExecutor for Pipeline {
    fn execute(&self, task: Task, cancel: &AtomicBool) -> TaskResult {
        self.run(task, cancel)
    }
}

/// Header selection, special handler, then the always-on normalisation.
fn shape_table(grid: Grid, filename: &str, rule: Option<&HandlerRule>) -> Result<ParsedTable, ParseError> {
    let (skip_rows, header_row) = rule.map(|r| (r.skip_rows, r.header_row)).unwrap_or((0, 0));
    let mut table = ParsedTable::from_grid(grid, filename, skip_rows, header_row)?;
    if let Some(rule) = rule {
        handlers::apply(rule, &mut table, filename);
    }
    table.normalize();
    Ok(table)
}

fn check_cancel(cancel: &AtomicBool, stage: &str) -> Result<(), IngestError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(IngestError::Cancelled(format!("time limit reached while {}", stage)));
    }
    Ok(())
}
