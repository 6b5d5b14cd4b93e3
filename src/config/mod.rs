//! Configuration module for the stale record sweeper.
//!
//! The sweeper is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [retention]
//! enabled = true
//! frequency = "weekly"
//! day_of_week = 3
//! time_of_day = "2:00pm +0000"
//!
//! [cache]
//! type = "redis"
//! url = "redis://:${REDIS_PASSWORD}@localhost:6379"
//! ```

mod cache;
mod database;
mod observability;
mod retention;

use std::{path::Path, sync::LazyLock};

pub use cache::*;
pub use database::*;
pub use observability::*;
pub use retention::*;
use serde::{Deserialize, Serialize};

/// Root configuration for the sweeper.
///
/// All sections are optional. An empty file yields a disabled retention job
/// with an in-memory lock store and no record database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweeperConfig {
    /// Retention schedule and purge settings.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Shared store for cluster locks and job metadata.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Record database the purge runs against.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Observability configuration (logging, metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl SweeperConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing variables cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        // Catch backends that need a cargo feature before serde turns them
        // into an "unknown variant" error.
        let raw: toml::Value = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        check_disabled_features(&raw)?;

        let config: SweeperConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&self) -> Result<(), ConfigError> {
        self.retention.validate()?;
        self.cache.validate()?;
        self.database.validate()?;

        if self.retention.enabled && matches!(self.cache, CacheConfig::Memory(_)) {
            tracing::debug!(
                "Retention uses the in-memory lock store; runs are only exclusive within this process"
            );
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Reject configured backends whose cargo feature is not compiled in.
fn check_disabled_features(raw: &toml::Value) -> Result<(), ConfigError> {
    let mut issues: Vec<(String, &str)> = Vec::new();

    if let Some(type_val) = raw
        .get("cache")
        .and_then(|v| v.get("type"))
        .and_then(|v| v.as_str())
    {
        check_cache_feature(type_val, &mut issues);
    }

    if let Some(type_val) = raw
        .get("database")
        .and_then(|v| v.get("type"))
        .and_then(|v| v.as_str())
    {
        check_database_feature(type_val, &mut issues);
    }

    if raw
        .get("observability")
        .and_then(|v| v.get("metrics"))
        .and_then(|v| v.get("enabled"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        check_metrics_feature(&mut issues);
    }

    if issues.is_empty() {
        return Ok(());
    }

    let mut features: Vec<&str> = issues.iter().map(|(_, f)| *f).collect();
    features.sort_unstable();
    features.dedup();

    let details = issues
        .iter()
        .map(|(msg, _)| format!("  - {msg}"))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::Validation(format!(
        "Configuration requires features that are not compiled in:\n{details}\n\
         Rebuild with: cargo build --features {}",
        features.join(",")
    )))
}

fn check_cache_feature(type_val: &str, _issues: &mut Vec<(String, &str)>) {
    #[cfg(not(feature = "redis"))]
    if type_val == "redis" {
        _issues.push(("cache.type = \"redis\" requires the 'redis' feature".into(), "redis"));
    }
    #[cfg(feature = "redis")]
    let _ = type_val;
}

fn check_database_feature(type_val: &str, _issues: &mut Vec<(String, &str)>) {
    #[cfg(not(feature = "database-sqlite"))]
    if type_val == "sqlite" {
        _issues.push((
            "database.type = \"sqlite\" requires the 'database-sqlite' feature".into(),
            "database-sqlite",
        ));
    }
    #[cfg(feature = "database-sqlite")]
    let _ = type_val;
}

fn check_metrics_feature(_issues: &mut Vec<(String, &str)>) {
    #[cfg(not(feature = "prometheus"))]
    _issues.push((
        "observability.metrics.enabled requires the 'prometheus' feature".into(),
        "prometheus",
    ));
}

static ENV_VAR_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is a valid regex")
});

/// Expand environment variables in the format `${VAR_NAME}`.
/// Variables that appear after a `#` on the same line are left untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in ENV_VAR_PATTERN.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);

            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SweeperConfig::from_str("").unwrap();
        assert!(!config.retention.enabled);
        assert!(matches!(config.cache, CacheConfig::Memory(_)));
        assert!(config.database.is_none());
    }

    #[test]
    fn test_full_retention_section() {
        let config = SweeperConfig::from_str(
            r#"
            [retention]
            enabled = true
            frequency = "weekly"
            day_of_week = 3
            time_of_day = "2:00pm +0000"
            batch_size = 200
            max_age_days = 30

            [retention.safety]
            dry_run = true
        "#,
        )
        .unwrap();

        assert!(config.retention.enabled);
        assert_eq!(config.retention.day_of_week, 3);
        assert_eq!(config.retention.batch_size, 200);
        assert!(config.retention.safety.dry_run);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = SweeperConfig::from_str(
            r#"
            [retention]
            enabled = true
            interval_hours = 24
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("SWEEPER_TEST_FREQUENCY", Some("daily"), || {
            let config = SweeperConfig::from_str(
                r#"
                [retention]
                frequency = "${SWEEPER_TEST_FREQUENCY}"
            "#,
            )
            .unwrap();
            assert_eq!(config.retention.frequency, "daily");
        });
    }

    #[test]
    fn test_missing_env_var() {
        temp_env::with_var_unset("SWEEPER_TEST_MISSING", || {
            let err = SweeperConfig::from_str(
                r#"
                [retention]
                frequency = "${SWEEPER_TEST_MISSING}"
            "#,
            )
            .unwrap_err();
            assert!(
                matches!(err, ConfigError::EnvVarNotFound(ref name) if name == "SWEEPER_TEST_MISSING")
            );
        });
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let input = "frequency = \"daily\" # ${NOT_EXPANDED}";
        assert_eq!(expand_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_validation_error_surfaces() {
        let err = SweeperConfig::from_str(
            r#"
            [retention]
            max_age_days = 0
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[cfg(not(feature = "redis"))]
    #[test]
    fn test_redis_without_feature() {
        let err = SweeperConfig::from_str(
            r#"
            [cache]
            type = "redis"
            url = "redis://localhost:6379"
        "#,
        )
        .unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("--features redis")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retention]\nenabled = true\nfrequency = \"daily\"").unwrap();

        let config = SweeperConfig::from_file(file.path()).unwrap();
        assert!(config.retention.enabled);
        assert_eq!(config.retention.frequency, "daily");
    }

    #[test]
    fn test_from_missing_file() {
        let err = SweeperConfig::from_file("/nonexistent/stale-sweeper.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }
}
