//! Destination tables: transactional loads and read-only browsing.
//!
//! Table and column names come from files and request paths, so every
//! identifier is validated and then double-quoted before it reaches SQL.

use std::sync::atomic::{AtomicBool, Ordering};

use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use serde_json::{Map, Value};

use super::{Database, DatabaseError};
use crate::parser::Cell;

/// Tables owned by the service itself, hidden from table listings.
const INTERNAL_TABLES: &[&str] = &["jobs", "_migrations"];

/// Whether `name` is one of the service's own tables or SQLite's.
/// SQLite compares table names case-insensitively, and so does this.
pub fn is_internal(name: &str) -> bool {
    INTERNAL_TABLES.iter().any(|t| t.eq_ignore_ascii_case(name))
        || name
            .get(..7)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("sqlite_"))
}

pub const DEFAULT_PAGE_SIZE: u64 = 100;
pub const MAX_PAGE_SIZE: u64 = 5000;

/// SQLite column affinity inferred from the values of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Real,
    Text,
}

impl Affinity {
    fn sql(&self) -> &'static str {
        match self {
            Affinity::Integer => "INTEGER",
            Affinity::Real => "REAL",
            Affinity::Text => "TEXT",
        }
    }
}

/// Infers the affinity of column `index`: all-integer → INTEGER, numeric →
/// REAL, anything textual (or no values at all) → TEXT.
pub fn infer_affinity(rows: &[Vec<Cell>], index: usize) -> Affinity {
    let mut affinity: Option<Affinity> = None;
    for cell in rows.iter().filter_map(|r| r.get(index)) {
        let next = match cell {
            Cell::Null => continue,
            Cell::Integer(_) => Affinity::Integer,
            Cell::Real(_) => Affinity::Real,
            Cell::Text(_) => return Affinity::Text,
        };
        affinity = Some(match (affinity, next) {
            (Some(Affinity::Real), _) | (_, Affinity::Real) => Affinity::Real,
            _ => Affinity::Integer,
        });
    }
    affinity.unwrap_or(Affinity::Text)
}

/// Double-quotes an identifier for SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validates a user-supplied table name (`[A-Za-z0-9_\- ]+`).
pub fn validate_name(name: &str) -> Result<(), DatabaseError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' '));
    if valid {
        Ok(())
    } else {
        Err(DatabaseError::InvalidIdentifier(name.to_string()))
    }
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Column names of a table in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// Appends `rows` to `table` inside the caller's transaction.
///
/// Creates the table when missing and adds any columns it lacks. The
/// `cancel` flag is checked before every row and once more at the end; a
/// raised flag aborts the load so the caller's transaction rolls back.
pub fn load_rows(
    conn: &Connection,
    table: &str,
    columns: &[String],
    rows: &[Vec<Cell>],
    cancel: &AtomicBool,
) -> Result<usize, DatabaseError> {
    if columns.is_empty() {
        return Err(DatabaseError::InvalidIdentifier(format!(
            "{} (no columns)",
            table
        )));
    }

    if table_exists(conn, table)? {
        let existing = table_columns(conn, table)?;
        for (i, column) in columns.iter().enumerate() {
            if !existing.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                log::info!("Adding column {} to table {}", column, table);
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(table),
                    quote_ident(column),
                    infer_affinity(rows, i).sql()
                ))?;
            }
        }
    } else {
        let definitions: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} {}", quote_ident(c), infer_affinity(rows, i).sql()))
            .collect();
        log::info!("Creating table {} ({} columns)", table, columns.len());
        conn.execute_batch(&format!(
            "CREATE TABLE {} ({})",
            quote_ident(table),
            definitions.join(", ")
        ))?;
    }

    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        column_list.join(", "),
        placeholders.join(", ")
    ))?;

    let mut inserted = 0;
    for row in rows {
        if cancel.load(Ordering::Relaxed) {
            return Err(DatabaseError::Aborted(format!(
                "load into {} cancelled after {} rows",
                table, inserted
            )));
        }
        inserted += stmt.execute(params_from_iter(row.iter().take(columns.len())))?;
    }

    if cancel.load(Ordering::Relaxed) {
        return Err(DatabaseError::Aborted(format!(
            "load into {} cancelled before commit",
            table
        )));
    }

    Ok(inserted)
}

/// Names of all user tables, sorted.
pub fn list_tables(db: &Database) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names
            .into_iter()
            .filter(|n| !is_internal(n))
            .collect())
    })
}

/// Paging and filtering options for [`table_data`].
#[derive(Debug, Clone, Default)]
pub struct TableQuery {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// `(column, needle)` pairs; each is a case-insensitive substring match.
    pub filters: Vec<(String, String)>,
}

impl TableQuery {
    /// Requested page size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(&self) -> u64 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of a table's rows.
#[derive(Debug, Clone, Serialize)]
pub struct TablePage {
    pub data: Vec<Map<String, Value>>,
    pub total_rows: u64,
    pub columns: Vec<String>,
}

/// Reads a page of rows from `table`. Returns `Ok(None)` when the table does
/// not exist; filtering on an unknown column is an `InvalidIdentifier` error.
pub fn table_data(
    db: &Database,
    table: &str,
    query: &TableQuery,
) -> Result<Option<TablePage>, DatabaseError> {
    validate_name(table)?;
    if is_internal(table) {
        return Ok(None);
    }

    db.with_conn(|conn| {
        if !table_exists(conn, table)? {
            return Ok(None);
        }
        let columns = table_columns(conn, table)?;

        let mut conditions = Vec::new();
        let mut values: Vec<String> = Vec::new();
        for (column, needle) in &query.filters {
            let Some(actual) = columns.iter().find(|c| c.eq_ignore_ascii_case(column)) else {
                return Err(DatabaseError::InvalidIdentifier(column.clone()));
            };
            values.push(format!("%{}%", needle.to_lowercase()));
            conditions.push(format!(
                "LOWER(CAST({} AS TEXT)) LIKE ?{}",
                quote_ident(actual),
                values.len()
            ));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let total_rows: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} {}", quote_ident(table), where_clause),
            params_from_iter(values.iter()),
            |r| r.get(0),
        )?;

        let sql = format!(
            "SELECT * FROM {} {} ORDER BY rowid LIMIT {} OFFSET {}",
            quote_ident(table),
            where_clause,
            query.effective_limit(),
            query.offset.unwrap_or(0)
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut data = Vec::new();
        while let Some(row) = rows.next()? {
            let mut object = Map::new();
            for (i, column) in columns.iter().enumerate() {
                object.insert(column.clone(), json_value(row.get_ref(i)?));
            }
            data.push(object);
        }

        Ok(Some(TablePage {
            data,
            total_rows,
            columns,
        }))
    })
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

/// Existing tables among `candidates` whose names match `pattern`, sorted.
pub fn matching_tables(
    conn: &Connection,
    candidates: &[String],
    pattern: &Regex,
) -> Result<Vec<String>, DatabaseError> {
    let mut found = Vec::new();
    for name in candidates {
        if pattern.is_match(name) && table_exists(conn, name)? {
            found.push(name.clone());
        }
    }
    found.sort();
    found.dedup();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Cell {
        Cell::Text(s.to_string())
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn load(db: &Database, table: &str, columns: &[String], rows: &[Vec<Cell>]) -> usize {
        let cancel = AtomicBool::new(false);
        db.with_transaction(|tx| load_rows(tx, table, columns, rows, &cancel))
            .unwrap()
    }

    #[test]
    fn test_infer_affinity() {
        let rows = vec![
            vec![Cell::Integer(1), Cell::Integer(1), text("a"), Cell::Null],
            vec![Cell::Null, Cell::Real(2.5), Cell::Integer(3), Cell::Null],
        ];
        assert_eq!(infer_affinity(&rows, 0), Affinity::Integer);
        assert_eq!(infer_affinity(&rows, 1), Affinity::Real);
        assert_eq!(infer_affinity(&rows, 2), Affinity::Text);
        assert_eq!(infer_affinity(&rows, 3), Affinity::Text);
    }

    #[test]
    fn test_load_creates_then_appends_with_new_columns() {
        let db = Database::open_in_memory().unwrap();
        let n = load(
            &db,
            "ta_week1",
            &cols(&["employee", "hours"]),
            &[vec![text("alice"), Cell::Real(7.5)]],
        );
        assert_eq!(n, 1);

        let n = load(
            &db,
            "ta_week1",
            &cols(&["employee", "hours", "project"]),
            &[
                vec![text("bob"), Cell::Integer(8), text("apollo")],
                vec![text("carol"), Cell::Real(6.0), Cell::Null],
            ],
        );
        assert_eq!(n, 2);

        let page = table_data(&db, "ta_week1", &TableQuery::default())
            .unwrap()
            .unwrap();
        assert_eq!(page.total_rows, 3);
        assert_eq!(page.columns, cols(&["employee", "hours", "project"]));
        assert_eq!(page.data[0]["project"], Value::Null);
        assert_eq!(page.data[1]["project"], Value::from("apollo"));
    }

    #[test]
    fn test_cancelled_load_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let cancel = AtomicBool::new(true);
        let result = db.with_transaction(|tx| {
            load_rows(
                tx,
                "t_cancel",
                &cols(&["a"]),
                &[vec![Cell::Integer(1)]],
                &cancel,
            )
        });
        assert!(matches!(result, Err(DatabaseError::Aborted(_))));
        assert!(table_data(&db, "t_cancel", &TableQuery::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_list_tables_hides_internal() {
        let db = Database::open_in_memory().unwrap();
        load(&db, "sales", &cols(&["x"]), &[vec![Cell::Integer(1)]]);
        assert_eq!(list_tables(&db).unwrap(), vec!["sales".to_string()]);
    }

    #[test]
    fn test_is_internal() {
        assert!(is_internal("jobs"));
        assert!(is_internal("JOBS"));
        assert!(is_internal("_migrations"));
        assert!(is_internal("sqlite_sequence"));
        assert!(is_internal("SQLite_stat1"));
        assert!(!is_internal("jobs_2024"));
        assert!(!is_internal("sqlite"));
        assert!(!is_internal("ta_week1"));
    }

    #[test]
    fn test_table_data_filters_and_paging() {
        let db = Database::open_in_memory().unwrap();
        let rows: Vec<Vec<Cell>> = (0..10)
            .map(|i| {
                vec![
                    text(if i % 2 == 0 { "Alice" } else { "Bob" }),
                    Cell::Integer(i),
                ]
            })
            .collect();
        load(&db, "people", &cols(&["name", "n"]), &rows);

        let query = TableQuery {
            filters: vec![("name".to_string(), "ALI".to_string())],
            limit: Some(2),
            offset: Some(1),
        };
        let page = table_data(&db, "people", &query).unwrap().unwrap();
        assert_eq!(page.total_rows, 5);
        assert_eq!(page.data.len(), 2);
        assert_eq!(page.data[0]["n"], Value::from(2));

        let bad = TableQuery {
            filters: vec![("missing".to_string(), "x".to_string())],
            ..Default::default()
        };
        assert!(matches!(
            table_data(&db, "people", &bad),
            Err(DatabaseError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_table_name_validation() {
        let db = Database::open_in_memory().unwrap();
        assert!(validate_name("Sheet 1-final_v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(matches!(
            table_data(&db, "x; DROP TABLE jobs", &TableQuery::default()),
            Err(DatabaseError::InvalidIdentifier(_))
        ));
        assert!(table_data(&db, "jobs", &TableQuery::default())
            .unwrap()
            .is_none());
        assert!(table_data(&db, "nope", &TableQuery::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(TableQuery::default().effective_limit(), 100);
        let q = TableQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(q.effective_limit(), 1);
        let q = TableQuery {
            limit: Some(1_000_000),
            ..Default::default()
        };
        assert_eq!(q.effective_limit(), 5000);
    }
}
