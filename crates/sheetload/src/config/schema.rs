use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// SQLite database file. Defaults to `~/.sheetload/data/sheetload.db`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Directory backing the object-storage bucket.
    #[serde(default)]
    pub bucket_directory: Option<PathBuf>,
    #[serde(default = "default_bucket_name")]
    pub bucket_name: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub handlers: Vec<HandlerRule>,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_bucket_name() -> String {
    "uploads".to_string()
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_max_write_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            bucket_directory: None,
            bucket_name: default_bucket_name(),
            worker_count: default_worker_count(),
            task_timeout_secs: default_task_timeout_secs(),
            max_write_retries: default_max_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            handlers: Vec::new(),
            analytics: AnalyticsConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
    }

    /// Bucket directory, defaulting to `bucket/` next to the database file.
    pub fn resolved_bucket_directory(&self) -> Option<PathBuf> {
        self.bucket_directory.clone().or_else(|| {
            self.resolved_database_path()
                .and_then(|db| db.parent().map(|p| p.join("bucket")))
        })
    }
}

/// Filename-matched rule that reshapes a parsed table before it is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerRule {
    pub id: String,
    /// Regex matched against the submitted filename.
    pub filename_pattern: String,
    #[serde(default)]
    pub priority: i32,
    /// Worksheet to read instead of the first one.
    #[serde(default)]
    pub sheet: Option<String>,
    /// Destination table instead of the one derived from the filename.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub skip_rows: usize,
    #[serde(default)]
    pub header_row: usize,
    /// Source column name → new name. Names compare after normalisation.
    #[serde(default)]
    pub rename: HashMap<String, String>,
    #[serde(default)]
    pub drop_columns: Vec<String>,
    /// Appends a `source_file` column holding the submitted filename.
    #[serde(default)]
    pub add_source_column: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default = "default_source_pattern")]
    pub source_pattern: String,
    #[serde(default = "default_combined_table")]
    pub combined_table: String,
    #[serde(default = "default_hours_table")]
    pub hours_table: String,
    #[serde(default = "default_group_by")]
    pub group_by: Vec<String>,
    #[serde(default = "default_hours_column")]
    pub hours_column: String,
}

fn default_source_pattern() -> String {
    "^ta_".to_string()
}

fn default_combined_table() -> String {
    "ta_combined".to_string()
}

fn default_hours_table() -> String {
    "ta_hours".to_string()
}

fn default_group_by() -> Vec<String> {
    vec!["employee".to_string()]
}

fn default_hours_column() -> String {
    "hours".to_string()
}

impl AnalyticsConfig {
    /// Whether `table` is rebuilt by the analytics builder. Such tables only
    /// ever hold derived rows.
    pub fn owns_table(&self, table: &str) -> bool {
        self.combined_table.eq_ignore_ascii_case(table)
            || self.hours_table.eq_ignore_ascii_case(table)
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            source_pattern: default_source_pattern(),
            combined_table: default_combined_table(),
            hours_table: default_hours_table(),
            group_by: default_group_by(),
            hours_column: default_hours_column(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config: Config = serde_json::from_str(r#"{ "version": "1.0" }"#).unwrap();
        assert_eq!(config.task_timeout_secs, 300);
        assert_eq!(config.max_write_retries, 3);
        assert_eq!(config.retry_backoff_ms, 500);
        assert_eq!(config.bucket_name, "uploads");
        assert_eq!(config.analytics.source_pattern, "^ta_");
        assert_eq!(config.analytics.group_by, vec!["employee".to_string()]);
        assert_eq!(config.server.bind, "127.0.0.1:8000");
        assert!(config.worker_count >= 1);
    }

    #[test]
    fn test_handler_rule_defaults() {
        let rule: HandlerRule = serde_json::from_str(
            r#"{ "id": "payroll", "filename_pattern": "(?i)^payroll" }"#,
        )
        .unwrap();
        assert_eq!(rule.priority, 0);
        assert_eq!(rule.skip_rows, 0);
        assert!(rule.rename.is_empty());
        assert!(!rule.add_source_column);
    }

    #[test]
    fn test_bucket_directory_defaults_next_to_database() {
        let config = Config {
            database_path: Some(PathBuf::from("/srv/sheetload/data.db")),
            ..Default::default()
        };
        assert_eq!(
            config.resolved_bucket_directory(),
            Some(PathBuf::from("/srv/sheetload/bucket"))
        );
    }
}
