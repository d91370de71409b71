//! Special handlers: filename-matched rules that reshape a parsed table.

use std::collections::HashSet;

use regex::Regex;

use crate::config::HandlerRule;
use crate::error::ConfigError;
use crate::parser::{to_identifier, Cell, ParsedTable};

/// Name of the column added by `add_source_column`.
pub const SOURCE_COLUMN: &str = "source_file";

pub struct HandlerSet {
    /// Sorted by priority, highest first. Ties keep configuration order.
    handlers: Vec<(HandlerRule, Regex)>,
}

impl HandlerSet {
    pub fn new(mut rules: Vec<HandlerRule>) -> Result<Self, ConfigError> {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        let handlers = rules
            .into_iter()
            .map(|rule| {
                let pattern =
                    Regex::new(&rule.filename_pattern).map_err(|e| ConfigError::InvalidHandler {
                        id: rule.id.clone(),
                        reason: format!("Invalid regex pattern: {}", e),
                    })?;
                Ok((rule, pattern))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self { handlers })
    }

    pub fn empty() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// The highest-priority rule whose pattern matches `filename`.
    pub fn find(&self, filename: &str) -> Option<&HandlerRule> {
        self.handlers
            .iter()
            .find(|(_, pattern)| pattern.is_match(filename))
            .map(|(rule, _)| rule)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Applies a rule's column operations: renames, then drops, then the
/// optional source-file column. Column names compare after normalisation,
/// so `"Worker Name"` in a rule matches a `worker_name` header and vice versa.
pub fn apply(rule: &HandlerRule, table: &mut ParsedTable, filename: &str) {
    if !rule.rename.is_empty() {
        for column in table.columns.iter_mut() {
            let key = to_identifier(column);
            if let Some((_, to)) = rule
                .rename
                .iter()
                .find(|(from, _)| to_identifier(from) == key)
            {
                *column = to.clone();
            }
        }
    }

    if !rule.drop_columns.is_empty() {
        let drops: HashSet<String> = rule.drop_columns.iter().map(|c| to_identifier(c)).collect();
        let keep: Vec<bool> = table
            .columns
            .iter()
            .map(|c| !drops.contains(&to_identifier(c)))
            .collect();

        table.columns = retain_by_mask(std::mem::take(&mut table.columns), &keep);
        for row in table.rows.iter_mut() {
            *row = retain_by_mask(std::mem::take(row), &keep);
        }
    }

    if rule.add_source_column {
        table.columns.push(SOURCE_COLUMN.to_string());
        for row in table.rows.iter_mut() {
            row.push(Cell::Text(filename.to_string()));
        }
    }
}

fn retain_by_mask<T>(items: Vec<T>, keep: &[bool]) -> Vec<T> {
    items
        .into_iter()
        .zip(keep.iter())
        .filter(|&(_, &k)| k)
        .map(|(item, _)| item)
        .collect()
}
