use std::time::Duration;

use crate::config::schema::{AnalyticsConfig, HandlerRule};
use crate::config::Config;

/// Settings the task runners need, extracted from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_write_retries: u32,
    /// Base delay between write retries; attempt `n` waits `n` times this.
    pub retry_backoff: Duration,
    pub handlers: Vec<HandlerRule>,
    pub analytics: AnalyticsConfig,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_write_retries: config.max_write_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            handlers: config.handlers.clone(),
            analytics: config.analytics.clone(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
