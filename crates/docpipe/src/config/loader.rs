//! Settings resolution: defaults, then an optional JSON file, then
//! `DOCPIPE_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::{LogFormat, Settings};
use crate::error::ConfigError;
use crate::model::Stage;

/// Names the optional JSON settings file.
pub const CONFIG_PATH_VAR: &str = "DOCPIPE_CONFIG";

/// Reads settings from the process environment.
pub fn from_env() -> Result<Settings, ConfigError> {
    let lookup = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
    let file = lookup(CONFIG_PATH_VAR).map(PathBuf::from);
    load_settings(file.as_deref(), lookup)
}

/// Resolves settings with an explicit file and variable source.
pub fn load_settings<F>(file: Option<&Path>, lookup: F) -> Result<Settings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut settings = match file {
        Some(path) => {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            tracing::debug!(path = %path.display(), "Loading settings file");
            parse_json(&content)?
        }
        None => Settings::default(),
    };

    apply_overrides(&mut settings, lookup)?;
    settings.validate()?;
    Ok(settings)
}

/// Parses and validates a JSON settings document without env overrides.
pub fn load_settings_from_str(content: &str) -> Result<Settings, ConfigError> {
    let settings = parse_json(content)?;
    settings.validate()?;
    Ok(settings)
}

fn parse_json(content: &str) -> Result<Settings, ConfigError> {
    Ok(serde_json::from_str(content)?)
}

fn apply_overrides<F>(settings: &mut Settings, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("DOCPIPE_STAGE") {
        settings.stage = parse::<Stage>("DOCPIPE_STAGE", &v)?;
    }
    if let Some(v) = lookup("DOCPIPE_QUEUE_NAME") {
        settings.queue_name = Some(v);
    }
    if let Some(v) = lookup("DOCPIPE_DATABASE_PATH") {
        settings.database_path = Some(PathBuf::from(v));
    }
    if let Some(v) = lookup("DOCPIPE_MAX_CONCURRENT_TASKS") {
        settings.max_concurrent_tasks = parse("DOCPIPE_MAX_CONCURRENT_TASKS", &v)?;
    }
    if let Some(v) = lookup("DOCPIPE_VISIBILITY_TIMEOUT") {
        settings.visibility_timeout_secs = parse("DOCPIPE_VISIBILITY_TIMEOUT", &v)?;
    }
    if let Some(v) = lookup("DOCPIPE_POLL_INTERVAL") {
        settings.poll_interval_secs = parse("DOCPIPE_POLL_INTERVAL", &v)?;
    }
    if let Some(v) = lookup("DOCPIPE_WAIT_TIME_SECONDS") {
        settings.wait_time_secs = parse("DOCPIPE_WAIT_TIME_SECONDS", &v)?;
    }
    if let Some(v) = lookup("DOCPIPE_BATCH_SIZE") {
        settings.batch_size = parse("DOCPIPE_BATCH_SIZE", &v)?;
    }
    if let Some(v) = lookup("DOCPIPE_MAX_RETRIES") {
        settings.max_retries = parse("DOCPIPE_MAX_RETRIES", &v)?;
    }
    if let Some(v) = lookup("DOCPIPE_SUPERVISOR_CHECK_INTERVAL") {
        settings.supervisor_check_secs = parse("DOCPIPE_SUPERVISOR_CHECK_INTERVAL", &v)?;
    }
    if let Some(v) = lookup("DOCPIPE_LOG_FORMAT") {
        settings.log_format = parse::<LogFormat>("DOCPIPE_LOG_FORMAT", &v)?;
    }
    if let Some(v) = lookup("DOCPIPE_PROCESSOR_COMMAND") {
        settings.processor_command = Some(v);
    }
    Ok(())
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides_defaults() {
        let settings = load_settings(
            None,
            vars(&[
                ("DOCPIPE_STAGE", "chunking"),
                ("DOCPIPE_MAX_CONCURRENT_TASKS", "4"),
                ("DOCPIPE_LOG_FORMAT", "json"),
            ]),
        )
        .unwrap();
        assert_eq!(settings.stage, Stage::Chunking);
        assert_eq!(settings.queue_name(), "chunking");
        assert_eq!(settings.max_concurrent_tasks, 4);
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.batch_size, 3);
    }

    #[test]
    fn test_file_then_env_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"stage": "vectorization", "batch_size": 5, "queue_name": "vec-q"}}"#
        )
        .unwrap();

        let settings =
            load_settings(Some(file.path()), vars(&[("DOCPIPE_BATCH_SIZE", "7")])).unwrap();
        assert_eq!(settings.stage, Stage::Vectorization);
        assert_eq!(settings.queue_name(), "vec-q");
        assert_eq!(settings.batch_size, 7);
    }

    #[test]
    fn test_malformed_number_is_invalid_value() {
        let err = load_settings(None, vars(&[("DOCPIPE_VISIBILITY_TIMEOUT", "ten")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "DOCPIPE_VISIBILITY_TIMEOUT");
                assert_eq!(value, "ten");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_out_of_range_override_fails_validation() {
        let err = load_settings(None, vars(&[("DOCPIPE_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
    }

    #[test]
    fn test_unknown_file_keys_are_rejected() {
        assert!(load_settings_from_str(r#"{"max_workers": 3}"#).is_err());
        assert!(load_settings_from_str("{}").is_ok());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_settings(Some(Path::new("/nonexistent/docpipe.json")), vars(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("DOCPIPE_QUEUE_NAME", "extraction-priority");
        std::env::set_var("DOCPIPE_MAX_RETRIES", "2");
        let settings = from_env();
        std::env::remove_var("DOCPIPE_QUEUE_NAME");
        std::env::remove_var("DOCPIPE_MAX_RETRIES");

        let settings = settings.unwrap();
        assert_eq!(settings.queue_name(), "extraction-priority");
        assert_eq!(settings.max_retries, 2);
    }
}
