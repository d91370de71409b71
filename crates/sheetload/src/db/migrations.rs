//! Versioned schema migrations recorded in `_migrations`.
//!
//! Each step runs in its own transaction together with the row that marks
//! it applied, so a crash mid-upgrade leaves the schema at a known version.

use std::collections::HashSet;

use rusqlite::{params, Connection};

use super::error::DatabaseError;

struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
    /// Skip the SQL (but still record the version) when this column exists.
    /// Databases created by early builds already carry some columns.
    unless_column: Option<(&'static str, &'static str)>,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "create_jobs_table",
        sql: include_str!("sql/001_create_jobs.sql"),
        unless_column: None,
    },
    Step {
        version: 2,
        name: "add_error_kind_to_jobs",
        sql: include_str!("sql/002_add_error_kind.sql"),
        unless_column: Some(("jobs", "error_kind")),
    },
];

/// Latest schema version this build knows about.
pub fn latest_version() -> u32 {
    STEPS.iter().map(|s| s.version).max().unwrap_or(0)
}

/// Brings the schema up to [`latest_version`].
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let applied = applied_versions(conn)?;
    for step in STEPS.iter().filter(|s| !applied.contains(&s.version)) {
        apply(conn, step)?;
    }
    Ok(())
}

fn applied_versions(conn: &Connection) -> Result<HashSet<u32>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT version FROM _migrations")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, u32>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(versions)
}

fn apply(conn: &Connection, step: &Step) -> Result<(), DatabaseError> {
    let failed = |e: rusqlite::Error| DatabaseError::Migration {
        version: step.version,
        reason: e.to_string(),
    };

    let skip = match step.unless_column {
        Some((table, column)) => column_exists(conn, table, column)?,
        None => false,
    };

    conn.execute_batch("BEGIN IMMEDIATE").map_err(failed)?;
    let result = (|| -> rusqlite::Result<()> {
        if skip {
            log::info!("Migration v{} already satisfied, recording only", step.version);
        } else {
            log::info!("Applying migration v{}: {}", step.version, step.name);
            conn.execute_batch(step.sql)?;
        }
        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            params![step.version, step.name],
        )?;
        Ok(())
    })();

    match result {
        Ok(()) => conn.execute_batch("COMMIT").map_err(failed),
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(failed(e))
        }
    }
}

/// Whether `table` has a column named `column` (`PRAGMA table_info`).
pub(crate) fn column_exists(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, DatabaseError> {
    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatabaseError::InvalidIdentifier(table.to_string()));
    }
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|name| name == column))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(conn: &Connection) -> u32 {
        conn.query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_fresh_database_reaches_latest_version() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        assert_eq!(recorded(&conn), STEPS.len() as u32);
        assert_eq!(latest_version(), 2);
        assert!(column_exists(&conn, "jobs", "error_kind").unwrap());
    }

    #[test]
    fn test_rerun_is_a_noop() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();
        assert_eq!(recorded(&conn), STEPS.len() as u32);
    }

    #[test]
    fn test_untracked_schema_is_adopted() {
        let conn = Connection::open_in_memory().unwrap();
        // Tables created before `_migrations` existed.
        conn.execute_batch(include_str!("sql/001_create_jobs.sql"))
            .unwrap();
        conn.execute_batch(include_str!("sql/002_add_error_kind.sql"))
            .unwrap();
        // Step 1 uses IF NOT EXISTS; step 2 must not add the column twice.
        run_all(&conn).unwrap();
        assert_eq!(recorded(&conn), STEPS.len() as u32);
    }

    #[test]
    fn test_column_exists() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE sample (id TEXT, name TEXT);")
            .unwrap();

        assert!(column_exists(&conn, "sample", "name").unwrap());
        assert!(!column_exists(&conn, "sample", "missing").unwrap());
        assert!(column_exists(&conn, "sample; DROP TABLE sample", "id").is_err());
    }
}
