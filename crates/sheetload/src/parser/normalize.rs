//! Column and table name normalisation.

use std::collections::HashSet;

/// Converts arbitrary header text into a snake_case SQL identifier.
///
/// `"Employee Name"` → `employee_name`, `"HoursWorked"` → `hours_worked`,
/// `"% Done"` → `done`. Names that would start with a digit are prefixed
/// with `c_`; names with no usable characters become an empty string.
pub fn to_identifier(raw: &str) -> String {
    let name = snake_case(raw);
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("c_{}", name)
    } else {
        name
    }
}

fn snake_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut prev_lower_or_digit = false;

    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            if ch.is_ascii_uppercase() && prev_lower_or_digit && !out.ends_with('_') {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower_or_digit = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        } else {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            prev_lower_or_digit = false;
        }
    }

    out.trim_matches('_').to_string()
}

/// Normalises a header row: snake_case identifiers, blanks named
/// `column_<n>`, repeated names suffixed `_2`, `_3`, … in order of appearance.
pub fn normalize_columns(columns: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut result = Vec::with_capacity(columns.len());

    for (i, raw) in columns.iter().enumerate() {
        let mut base = to_identifier(raw);
        if base.is_empty() {
            base = format!("column_{}", i + 1);
        }

        let mut name = base.clone();
        let mut suffix = 2;
        while seen.contains(&name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        seen.insert(name.clone());
        result.push(name);
    }

    result
}

/// Derives a destination table name from a filename stem.
///
/// Only `[a-z0-9_]` survive; a leading digit gets a `t_` prefix and an
/// empty result falls back to `imported`.
pub fn table_name_from_stem(stem: &str) -> String {
    let name = snake_case(stem);
    if name.is_empty() {
        "imported".to_string()
    } else if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("t_{}", name)
    } else {
        name
    }
}
