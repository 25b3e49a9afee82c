//! Worker settings.

pub mod loader;

pub use loader::{from_env, load_settings, load_settings_from_str, CONFIG_PATH_VAR};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerConfig;
use crate::error::ConfigError;
use crate::model::Stage;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'text' or 'json', got '{}'", other)),
        }
    }
}

/// Settings for one stage worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub stage: Stage,
    /// Defaults to the stage name.
    pub queue_name: Option<String>,
    /// Defaults to `~/.docpipe/data/docpipe.db`.
    pub database_path: Option<PathBuf>,
    pub max_concurrent_tasks: usize,
    pub visibility_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub wait_time_secs: u64,
    pub batch_size: usize,
    /// Retries for queue and record store calls.
    pub max_retries: u32,
    pub supervisor_check_secs: u64,
    pub log_format: LogFormat,
    /// Command run once per file. Required by the worker binary. Either a
    /// whitespace-separated line (no quoting) or a JSON array of strings.
    pub processor_command: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stage: Stage::Extraction,
            queue_name: None,
            database_path: None,
            max_concurrent_tasks: 10,
            visibility_timeout_secs: 600,
            poll_interval_secs: 1,
            wait_time_secs: 5,
            batch_size: 3,
            max_retries: 10,
            supervisor_check_secs: 60,
            log_format: LogFormat::Text,
            processor_command: None,
        }
    }
}

/// Upper bound on a lease, matching common hosted queues (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;
pub const MAX_BATCH_SIZE: usize = 10;
pub const MAX_WAIT_TIME_SECS: u64 = 20;

impl Settings {
    pub fn queue_name(&self) -> &str {
        self.queue_name
            .as_deref()
            .unwrap_or_else(|| self.stage.as_str())
    }

    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => crate::db::default_database_path().ok_or_else(|| ConfigError::Validation {
                message: "cannot determine home directory; set DOCPIPE_DATABASE_PATH".to_string(),
            }),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn supervisor_check_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor_check_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            max_concurrent_tasks: self.max_concurrent_tasks,
            batch_size: self.batch_size,
            wait_time: Duration::from_secs(self.wait_time_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            visibility_timeout: self.visibility_timeout(),
            retry: self.retry_policy(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: String| Err(ConfigError::Validation { message });

        if self.max_concurrent_tasks == 0 {
            return fail("max_concurrent_tasks must be at least 1".to_string());
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return fail(format!("batch_size must be between 1 and {}", MAX_BATCH_SIZE));
        }
        if !(1..=MAX_VISIBILITY_TIMEOUT_SECS).contains(&self.visibility_timeout_secs) {
            return fail(format!(
                "visibility_timeout_secs must be between 1 and {}",
                MAX_VISIBILITY_TIMEOUT_SECS
            ));
        }
        if self.wait_time_secs > MAX_WAIT_TIME_SECS {
            return fail(format!("wait_time_secs must be at most {}", MAX_WAIT_TIME_SECS));
        }
        if self.poll_interval_secs == 0 {
            return fail("poll_interval_secs must be at least 1".to_string());
        }
        if self.supervisor_check_secs == 0 {
            return fail("supervisor_check_secs must be at least 1".to_string());
        }
        if matches!(&self.queue_name, Some(name) if name.trim().is_empty()) {
            return fail("queue_name must not be empty".to_string());
        }
        Ok(())
    }
}
