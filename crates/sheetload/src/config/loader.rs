use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::Config;
use crate::db::table_repo;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

/// Semantic checks the schema cannot express.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker_count must be at least 1".to_string(),
        });
    }
    if config.task_timeout_secs == 0 {
        return Err(ConfigError::Validation {
            message: "task_timeout_secs must be at least 1".to_string(),
        });
    }

    let mut handler_ids = HashSet::new();
    for handler in &config.handlers {
        if !handler_ids.insert(&handler.id) {
            return Err(ConfigError::InvalidHandler {
                id: handler.id.clone(),
                reason: "Duplicate handler ID".to_string(),
            });
        }
        if let Err(e) = regex::Regex::new(&handler.filename_pattern) {
            return Err(ConfigError::InvalidHandler {
                id: handler.id.clone(),
                reason: format!("Invalid regex pattern: {}", e),
            });
        }
        if let Some(table) = &handler.table {
            if table_repo::validate_name(table).is_err() {
                return Err(ConfigError::InvalidHandler {
                    id: handler.id.clone(),
                    reason: format!("Invalid table name '{}'", table),
                });
            }
            if table_repo::is_internal(table) || config.analytics.owns_table(table) {
                return Err(ConfigError::InvalidHandler {
                    id: handler.id.clone(),
                    reason: format!("Table '{}' is reserved", table),
                });
            }
        }
    }

    if let Err(e) = regex::Regex::new(&config.analytics.source_pattern) {
        return Err(ConfigError::Validation {
            message: format!("Invalid analytics source_pattern: {}", e),
        });
    }
    for name in [&config.analytics.combined_table, &config.analytics.hours_table] {
        if table_repo::validate_name(name).is_err() {
            return Err(ConfigError::Validation {
                message: format!("Invalid analytics table name '{}'", name),
            });
        }
    }
    if config.analytics.combined_table == config.analytics.hours_table {
        return Err(ConfigError::Validation {
            message: "analytics combined_table and hours_table must differ".to_string(),
        });
    }

    Ok(())
}
