//! Tabular file parsing.
//!
//! Every parser turns raw file bytes into a grid of [`Cell`]s. Header
//! selection, handler reshaping and column normalisation happen afterwards
//! in [`ParsedTable`], so all formats share the same rules.

pub mod delimited;
pub mod normalize;
pub mod xlsx;

use std::path::Path;

use rusqlite::types::{ToSql, ToSqlOutput, Value};

use crate::error::ParseError;

pub use normalize::{normalize_columns, table_name_from_stem, to_identifier};

/// A single typed value read from a file.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    /// Types a raw textual value: integers and finite decimals become numbers,
    /// blanks become `Null`, everything else stays text.
    ///
    /// Integers are only recognised when they print back identically, so
    /// zero-padded codes such as `007` stay text.
    pub fn infer(raw: &str) -> Cell {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Cell::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            if i.to_string() == trimmed {
                return Cell::Integer(i);
            }
        }
        let numeric_chars = trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'));
        if numeric_chars && trimmed.chars().any(|c| c.is_ascii_digit()) {
            if let Ok(f) = trimmed.parse::<f64>() {
                if f.is_finite() && !is_zero_padded(trimmed) {
                    return Cell::Real(f);
                }
            }
        }
        Cell::Text(trimmed.to_string())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Cell::Null => true,
            Cell::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Text rendering used for header names.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Integer(i) => Some(i.to_string()),
            Cell::Real(f) => Some(f.to_string()),
            Cell::Text(s) => Some(s.clone()),
        }
    }
}

fn is_zero_padded(s: &str) -> bool {
    let digits = s.trim_start_matches(['-', '+']);
    digits.len() > 1 && digits.starts_with('0') && !digits.starts_with("0.")
}

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Null => ToSqlOutput::Owned(Value::Null),
            Cell::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Cell::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            Cell::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

/// Raw rows as read from the file, before a header is chosen.
pub type Grid = Vec<Vec<Cell>>;

/// Reads one tabular file format.
pub trait TableParser: Send + Sync {
    /// Parses `bytes` of a file with the given (lowercased) extension.
    /// `sheet` names a worksheet for multi-sheet formats and is ignored
    /// elsewhere.
    fn parse(&self, bytes: &[u8], extension: &str, sheet: Option<&str>)
        -> Result<Grid, ParseError>;
    fn supports(&self, extension: &str) -> bool;
}

/// Dispatches files to a parser by extension.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn TableParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            parsers: vec![
                Box::new(xlsx::XlsxParser),
                Box::new(delimited::DelimitedParser),
            ],
        }
    }

    pub fn parse(
        &self,
        filename: &str,
        bytes: &[u8],
        sheet: Option<&str>,
    ) -> Result<Grid, ParseError> {
        let extension = file_extension(filename);
        for parser in &self.parsers {
            if parser.supports(&extension) {
                return parser.parse(bytes, &extension, sheet);
            }
        }
        Err(ParseError::UnsupportedFormat(extension))
    }

    pub fn supports(&self, filename: &str) -> bool {
        let extension = file_extension(filename);
        self.parsers.iter().any(|p| p.supports(&extension))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercased extension of a filename, or an empty string.
pub fn file_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// A parsed table: normalised column names and rows padded to their width.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl ParsedTable {
    /// Splits a grid into header and data rows.
    ///
    /// `skip_rows` leading rows are discarded first; `header_row` is then the
    /// 0-based index of the header among the remaining rows. Rows above the
    /// header are ignored. Blank header cells are named `column_<n>`.
    pub fn from_grid(
        grid: Grid,
        filename: &str,
        skip_rows: usize,
        header_row: usize,
    ) -> Result<Self, ParseError> {
        let mut rows = grid.into_iter().skip(skip_rows);
        let mut header = None;
        for _ in 0..=header_row {
            header = rows.next();
        }
        let header = match header {
            Some(h) => h,
            None if skip_rows == 0 && header_row == 0 => {
                return Err(ParseError::MissingHeader(filename.to_string()))
            }
            None => {
                return Err(ParseError::HeaderOutOfRange {
                    filename: filename.to_string(),
                    row: skip_rows + header_row,
                })
            }
        };

        let mut columns: Vec<String> = header
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                cell.to_text()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| format!("column_{}", i + 1))
            })
            .collect();

        let data: Vec<Vec<Cell>> = rows.collect();
        let width = data.iter().map(Vec::len).max().unwrap_or(0);
        for i in columns.len()..width {
            columns.push(format!("column_{}", i + 1));
        }
        if columns.is_empty() {
            return Err(ParseError::MissingHeader(filename.to_string()));
        }

        let width = columns.len();
        let rows = data
            .into_iter()
            .map(|mut row| {
                row.resize(width, Cell::Null);
                row
            })
            .collect();

        Ok(Self { columns, rows })
    }

    /// Snake-cases and de-duplicates column names and drops fully empty rows.
    pub fn normalize(&mut self) {
        self.columns = normalize_columns(&self.columns);
        self.rows.retain(|row| !row.iter().all(Cell::is_empty));
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}
