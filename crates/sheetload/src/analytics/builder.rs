use std::sync::atomic::{AtomicBool, Ordering};

use regex::Regex;
use rusqlite::Connection;
use serde::Serialize;

use crate::config::AnalyticsConfig;
use crate::db::table_repo::{matching_tables, quote_ident, table_columns};
use crate::db::{job_repo, Database, DatabaseError};
use crate::error::ConfigError;

/// Column in the combined table naming the source table of each row.
pub const SOURCE_TABLE_COLUMN: &str = "source_table";
pub const TOTAL_HOURS_COLUMN: &str = "total_hours";
pub const ENTRIES_COLUMN: &str = "entries";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AnalyticsSummary {
    pub combined_rows: u64,
    pub hours_rows: u64,
    pub tables_processed: Vec<String>,
}

/// Rebuilds the derived analytics tables from ingested source tables.
pub struct AnalyticsBuilder {
    config: AnalyticsConfig,
    source_pattern: Regex,
}

impl AnalyticsBuilder {
    pub fn new(config: AnalyticsConfig) -> Result<Self, ConfigError> {
        let source_pattern =
            Regex::new(&config.source_pattern).map_err(|e| ConfigError::Validation {
                message: format!("Invalid analytics source_pattern: {}", e),
            })?;
        Ok(Self {
            config,
            source_pattern,
        })
    }

    /// Drops and recreates both derived tables in a single transaction.
    ///
    /// Readers see either the previous tables or the complete new ones.
    /// A raised `cancel` flag aborts the transaction between steps.
    pub fn build(&self, db: &Database, cancel: &AtomicBool) -> Result<AnalyticsSummary, DatabaseError> {
        let candidates = job_repo::completed_table_names(db)?;

        let summary = db.with_transaction(|tx| {
            let sources: Vec<String> = matching_tables(tx, &candidates, &self.source_pattern)?
                .into_iter()
                .filter(|t| !self.is_derived(t))
                .collect();
            log::info!("Building analytics from {} source table(s)", sources.len());

            check_cancel(cancel, "discovering sources")?;
            let combined_rows = self.rebuild_combined(tx, &sources)?;

            check_cancel(cancel, "building combined table")?;
            let hours_rows = self.rebuild_hours(tx)?;

            check_cancel(cancel, "building hours table")?;
            Ok(AnalyticsSummary {
                combined_rows,
                hours_rows,
                tables_processed: sources,
            })
        })?;

        log::info!(
            "Analytics rebuilt: {} combined rows, {} hours rows",
            summary.combined_rows,
            summary.hours_rows
        );
        Ok(summary)
    }

    fn is_derived(&self, table: &str) -> bool {
        table.eq_ignore_ascii_case(&self.config.combined_table)
            || table.eq_ignore_ascii_case(&self.config.hours_table)
    }

    fn rebuild_combined(&self, conn: &Connection, sources: &[String]) -> Result<u64, DatabaseError> {
        let table = &self.config.combined_table;

        // Union of source columns in first-seen order.
        let mut columns: Vec<String> = Vec::new();
        let mut source_columns = Vec::with_capacity(sources.len());
        for source in sources {
            let cols = table_columns(conn, source)?;
            for col in &cols {
                if col.eq_ignore_ascii_case(SOURCE_TABLE_COLUMN) {
                    continue;
                }
                if !columns.iter().any(|c| c.eq_ignore_ascii_case(col)) {
                    columns.push(col.clone());
                }
            }
            source_columns.push(cols);
        }

        let mut definitions = vec![format!("{} TEXT", quote_ident(SOURCE_TABLE_COLUMN))];
        definitions.extend(columns.iter().map(|c| quote_ident(c)));

        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({defs});",
            table = quote_ident(table),
            defs = definitions.join(", ")
        ))?;

        let mut target = vec![quote_ident(SOURCE_TABLE_COLUMN)];
        target.extend(columns.iter().map(|c| quote_ident(c)));

        for (source, cols) in sources.iter().zip(source_columns.iter()) {
            let mut select = vec!["?1".to_string()];
            select.extend(columns.iter().map(|column| {
                cols.iter()
                    .find(|c| c.eq_ignore_ascii_case(column))
                    .map(|c| quote_ident(c))
                    .unwrap_or_else(|| "NULL".to_string())
            }));

            let inserted = conn.execute(
                &format!(
                    "INSERT INTO {} ({}) SELECT {} FROM {} ORDER BY rowid",
                    quote_ident(table),
                    target.join(", "),
                    select.join(", "),
                    quote_ident(source)
                ),
                [source],
            )?;
            log::debug!("Combined {} rows from {}", inserted, source);
        }

        count_rows(conn, table)
    }

    fn rebuild_hours(&self, conn: &Connection) -> Result<u64, DatabaseError> {
        let table = &self.config.hours_table;
        let combined = &self.config.combined_table;
        let group_by = &self.config.group_by;

        let mut definitions: Vec<String> = group_by.iter().map(|c| quote_ident(c)).collect();
        definitions.push(format!("{} REAL", quote_ident(TOTAL_HOURS_COLUMN)));
        definitions.push(format!("{} INTEGER", quote_ident(ENTRIES_COLUMN)));

        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({defs});",
            table = quote_ident(table),
            defs = definitions.join(", ")
        ))?;

        let available = table_columns(conn, combined)?;
        let resolve = |name: &String| available.iter().find(|c| c.eq_ignore_ascii_case(name));

        let Some(hours) = resolve(&self.config.hours_column) else {
            log::info!(
                "Column {} not in {}, leaving {} empty",
                self.config.hours_column,
                combined,
                table
            );
            return Ok(0);
        };
        let mut keys = Vec::with_capacity(group_by.len());
        for name in group_by {
            match resolve(name) {
                Some(column) => keys.push(quote_ident(column)),
                None => {
                    log::info!("Column {} not in {}, leaving {} empty", name, combined, table);
                    return Ok(0);
                }
            }
        }

        let mut target: Vec<String> = group_by.iter().map(|c| quote_ident(c)).collect();
        target.push(quote_ident(TOTAL_HOURS_COLUMN));
        target.push(quote_ident(ENTRIES_COLUMN));

        let mut select = keys.clone();
        select.push(format!("SUM(CAST({} AS REAL))", quote_ident(hours)));
        select.push("COUNT(*)".to_string());

        let grouping = if keys.is_empty() {
            String::new()
        } else {
            format!(" GROUP BY {0} ORDER BY {0}", keys.join(", "))
        };

        conn.execute(
            &format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}{}",
                quote_ident(table),
                target.join(", "),
                select.join(", "),
                quote_ident(combined),
                grouping
            ),
            [],
        )?;

        count_rows(conn, table)
    }
}

fn count_rows(conn: &Connection, table: &str) -> Result<u64, DatabaseError> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |r| r.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn check_cancel(cancel: &AtomicBool, stage: &str) -> Result<(), DatabaseError> {
    if cancel.load(Ordering::Relaxed) {
        return Err(DatabaseError::Aborted(format!(
            "analytics build cancelled after {}",
            stage
        )));
    }
    Ok(())
}
