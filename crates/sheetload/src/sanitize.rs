//! Helpers for sanitizing data before it enters tracing span attributes.
//!
//! Uploaded filenames and object keys can carry client directory layouts;
//! spans only ever get the final name.

use std::path::Path;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// [`redact_path`] for client-supplied names and object keys, which may use
/// either separator.
pub fn redact_name(name: &str) -> String {
    redact_path(Path::new(&name.replace('\\', "/")))
}

/// First 12 hex digits of a content hash, enough to correlate log lines.
pub fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_path_returns_filename() {
        assert_eq!(
            redact_path(Path::new("/home/user/Documents/ta_week1.xlsx")),
            "ta_week1.xlsx"
        );
    }

    #[test]
    fn test_redact_path_no_filename() {
        assert_eq!(redact_path(Path::new("/")), "<unknown>");
    }

    #[test]
    fn test_redact_name_handles_windows_separators() {
        assert_eq!(redact_name("C:\\Users\\me\\hours.csv"), "hours.csv");
        assert_eq!(redact_name("reports/2024/hours.csv"), "hours.csv");
        assert_eq!(redact_name("hours.csv"), "hours.csv");
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_hash("abc"), "abc");
    }
}
