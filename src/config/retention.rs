//! Stale record retention configuration.
//!
//! Configures the recurring purge of records that have not been touched for
//! longer than the retention period.
//!
//! # Example
//!
//! ```toml
//! [retention]
//! enabled = true
//! frequency = "weekly"
//! day_of_week = 3            # 0 = Sunday
//! time_of_day = "2:00pm +0000"
//! batch_size = 50
//! max_age_days = 365
//!
//! [retention.safety]
//! dry_run = false
//! max_deletes_per_run = 0
//!
//! [[retention.owners]]
//! owner_id = "team-a"
//! max_age_days = 30
//! ```

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::retention::cadence::{Frequency, TimeOfDay};

/// Smallest batch size a run will use.
pub const MIN_BATCH_SIZE: u32 = 10;

/// Largest batch size a run will use.
pub const MAX_BATCH_SIZE: u32 = 1000;

/// Batch size used when none is configured.
pub const DEFAULT_BATCH_SIZE: u32 = 50;

/// Retention configuration.
///
/// The schedule fields are kept as the raw strings operators write and are
/// only parsed by [`RetentionConfig::job_settings`], so a disabled job never
/// fails on a malformed schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Whether the retention job is scheduled.
    /// Default: false (must be explicitly enabled)
    #[serde(default)]
    pub enabled: bool,

    /// `"daily"` or `"weekly"`.
    #[serde(default = "default_frequency")]
    pub frequency: String,

    /// Day of the week for weekly runs, 0 (Sunday) through 6 (Saturday).
    #[serde(default)]
    pub day_of_week: i64,

    /// Wall-clock start time with a fixed UTC offset, e.g. `"3:04pm -0700"`.
    #[serde(default = "default_time_of_day")]
    pub time_of_day: String,

    /// Records deleted per batch. Clamped to
    /// `[MIN_BATCH_SIZE, MAX_BATCH_SIZE]` when settings are resolved.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Records last updated more than this many days ago are purged.
    /// Fractional values are allowed.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: f64,

    /// Failed batches tolerated per run before the run aborts.
    /// 0 means the default of 100.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    /// Pause between batches, in seconds.
    #[serde(default = "default_pacing_secs")]
    pub pacing_secs: u64,

    /// How long stopping the job waits for the active run and the schedule
    /// to wind down, both on a configuration change and at shutdown.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Lifetime of the cluster lease, renewed while a run is active.
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,

    /// Safety settings to prevent accidental data loss.
    #[serde(default)]
    pub safety: RetentionSafety,

    /// Per-owner overrides. When empty, one global pass runs with
    /// `max_age_days`.
    #[serde(default)]
    pub owners: Vec<OwnerPolicyConfig>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: default_frequency(),
            day_of_week: 0,
            time_of_day: default_time_of_day(),
            batch_size: default_batch_size(),
            max_age_days: default_max_age_days(),
            max_failures: default_max_failures(),
            pacing_secs: default_pacing_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            safety: RetentionSafety::default(),
            owners: Vec::new(),
        }
    }
}

fn default_frequency() -> String {
    "weekly".to_string()
}

fn default_time_of_day() -> String {
    "1:00am +0000".to_string()
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

fn default_max_age_days() -> f64 {
    365.0
}

fn default_max_failures() -> u32 {
    100
}

fn default_pacing_secs() -> u64 {
    5
}

fn default_stop_timeout_secs() -> u64 {
    15
}

fn default_lock_ttl_secs() -> u64 {
    300
}

/// Safety settings for retention runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionSafety {
    /// If true, log what would be deleted without actually deleting.
    /// Default: false
    #[serde(default)]
    pub dry_run: bool,

    /// Maximum number of records to delete per run. 0 is unlimited.
    /// Default: 0
    #[serde(default)]
    pub max_deletes_per_run: u64,
}

/// Retention override for a single owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OwnerPolicyConfig {
    pub owner_id: String,

    /// Owners with retention disabled are skipped.
    #[serde(default = "default_owner_enabled")]
    pub enabled: bool,

    /// Overrides the global `max_age_days` for this owner.
    #[serde(default)]
    pub max_age_days: Option<f64>,
}

fn default_owner_enabled() -> bool {
    true
}

/// Resolved, validated settings for the retention job.
///
/// Built once per configuration change and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionJobSettings {
    pub enabled: bool,
    pub frequency: Frequency,
    pub day_of_week: u32,
    pub time_of_day: TimeOfDay,
    pub batch_size: u32,
}

impl RetentionJobSettings {
    fn disabled() -> Self {
        Self {
            enabled: false,
            frequency: Frequency::Weekly,
            day_of_week: 0,
            time_of_day: TimeOfDay::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl fmt::Display for RetentionJobSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enabled={}; freq={}; tod={}; batch_size={}",
            self.enabled, self.frequency, self.time_of_day, self.batch_size
        )?;
        if self.frequency == Frequency::Weekly {
            write!(f, "; dow={}", self.day_of_week)?;
        }
        Ok(())
    }
}

/// Errors resolving the schedule fields of [`RetentionConfig`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid frequency: {0}")]
    InvalidFrequency(String),

    #[error("invalid day of week: {0} (expected 0-6, 0 = Sunday)")]
    InvalidDayOfWeek(i64),

    #[error("invalid time of day: {0}")]
    InvalidTimeOfDay(String),
}

impl RetentionConfig {
    /// Resolve the schedule into [`RetentionJobSettings`].
    ///
    /// A disabled job resolves without parsing the schedule fields.
    pub fn job_settings(&self) -> Result<RetentionJobSettings, SettingsError> {
        if !self.enabled {
            return Ok(RetentionJobSettings::disabled());
        }

        let frequency: Frequency = self.frequency.parse()?;

        let day_of_week = u32::try_from(self.day_of_week)
            .ok()
            .filter(|d| *d <= 6)
            .ok_or(SettingsError::InvalidDayOfWeek(self.day_of_week))?;

        let time_of_day: TimeOfDay = self.time_of_day.parse()?;

        Ok(RetentionJobSettings {
            enabled: true,
            frequency,
            day_of_week,
            time_of_day,
            batch_size: clamp_batch_size(self.batch_size),
        })
    }

    /// Retention period as a chrono duration.
    pub fn max_age(&self) -> chrono::Duration {
        days_to_duration(self.max_age_days)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_secs(self.pacing_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        validate_age("retention.max_age_days", self.max_age_days)?;

        if self.lock_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "retention.lock_ttl_secs must be greater than 0".into(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for owner in &self.owners {
            if owner.owner_id.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "retention.owners entries require a non-empty owner_id".into(),
                ));
            }
            if !seen.insert(owner.owner_id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "retention.owners: duplicate owner_id '{}'",
                    owner.owner_id
                )));
            }
            if let Some(days) = owner.max_age_days {
                validate_age(&format!("retention.owners[{}].max_age_days", owner.owner_id), days)?;
            }
        }

        Ok(())
    }
}

fn validate_age(field: &str, days: f64) -> Result<(), ConfigError> {
    if !days.is_finite() || days <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "{field} must be a positive number of days, got {days}"
        )));
    }
    Ok(())
}

/// Clamp a configured batch size into the supported range.
pub fn clamp_batch_size(batch_size: u32) -> u32 {
    batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

/// Convert fractional days to a chrono duration with millisecond precision.
/// Ages too large for a duration saturate to [`chrono::Duration::MAX`].
pub fn days_to_duration(days: f64) -> chrono::Duration {
    chrono::Duration::try_milliseconds((days * 24.0 * 3600.0 * 1000.0) as i64)
        .unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, NaiveTime};
    use rstest::rstest;

    use super::*;

    fn enabled(toml: &str) -> RetentionConfig {
        let mut config: RetentionConfig = toml::from_str(toml).unwrap();
        config.enabled = true;
        config
    }

    #[test]
    fn test_default_config() {
        let config = RetentionConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.frequency, "weekly");
        assert_eq!(config.day_of_week, 0);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_age_days, 365.0);
        assert_eq!(config.max_failures, 100);
        assert_eq!(config.pacing(), Duration::from_secs(5));
        assert_eq!(config.stop_timeout(), Duration::from_secs(15));
        assert!(!config.safety.dry_run);
        assert_eq!(config.safety.max_deletes_per_run, 0);
        assert!(config.owners.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let config: RetentionConfig = toml::from_str("enabled = true").unwrap();
        assert!(config.enabled);
        assert_eq!(config.time_of_day, "1:00am +0000");
    }

    #[test]
    fn test_parse_owners() {
        let config: RetentionConfig = toml::from_str(
            r#"
            [[owners]]
            owner_id = "a"
            max_age_days = 30

            [[owners]]
            owner_id = "b"
            enabled = false
        "#,
        )
        .unwrap();
        assert_eq!(config.owners.len(), 2);
        assert_eq!(config.owners[0].max_age_days, Some(30.0));
        assert!(config.owners[0].enabled);
        assert!(!config.owners[1].enabled);
        assert_eq!(config.owners[1].max_age_days, None);
    }

    #[test]
    fn test_job_settings_resolves_schedule() {
        let config = enabled(
            r#"
            frequency = "weekly"
            day_of_week = 3
            time_of_day = "2:00pm -0700"
            batch_size = 200
        "#,
        );
        let settings = config.job_settings().unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.frequency, Frequency::Weekly);
        assert_eq!(settings.day_of_week, 3);
        assert_eq!(
            settings.time_of_day.time(),
            NaiveTime::from_hms_opt(14, 0, 0).unwrap()
        );
        assert_eq!(
            settings.time_of_day.offset(),
            FixedOffset::west_opt(7 * 3600).unwrap()
        );
        assert_eq!(settings.batch_size, 200);
    }

    #[rstest]
    #[case(0, MIN_BATCH_SIZE)]
    #[case(9, MIN_BATCH_SIZE)]
    #[case(10, 10)]
    #[case(500, 500)]
    #[case(1000, 1000)]
    #[case(5000, MAX_BATCH_SIZE)]
    fn test_batch_size_clamped(#[case] configured: u32, #[case] expected: u32) {
        let config = RetentionConfig {
            enabled: true,
            batch_size: configured,
            ..Default::default()
        };
        assert_eq!(config.job_settings().unwrap().batch_size, expected);
    }

    #[rstest]
    #[case(-1)]
    #[case(7)]
    fn test_day_of_week_out_of_range(#[case] day: i64) {
        let config = RetentionConfig {
            enabled: true,
            day_of_week: day,
            ..Default::default()
        };
        assert_eq!(
            config.job_settings().unwrap_err(),
            SettingsError::InvalidDayOfWeek(day)
        );
    }

    #[test]
    fn test_bad_frequency() {
        let config = RetentionConfig {
            enabled: true,
            frequency: "hourly".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.job_settings(),
            Err(SettingsError::InvalidFrequency(_))
        ));
    }

    #[test]
    fn test_bad_time_of_day() {
        let config = RetentionConfig {
            enabled: true,
            time_of_day: "25:00".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.job_settings(),
            Err(SettingsError::InvalidTimeOfDay(_))
        ));
    }

    #[test]
    fn test_disabled_skips_parsing() {
        let config = RetentionConfig {
            enabled: false,
            frequency: "never".into(),
            time_of_day: "garbage".into(),
            ..Default::default()
        };
        let settings = config.job_settings().unwrap();
        assert!(!settings.enabled);
    }

    #[test]
    fn test_settings_display() {
        let config = RetentionConfig {
            enabled: true,
            frequency: "daily".into(),
            time_of_day: "3:04pm -0700".into(),
            batch_size: 100,
            ..Default::default()
        };
        let settings = config.job_settings().unwrap();
        assert_eq!(
            settings.to_string(),
            "enabled=true; freq=daily; tod=3:04pm -0700; batch_size=100"
        );
    }

    #[test]
    fn test_fractional_max_age() {
        let config = RetentionConfig {
            max_age_days: 0.5,
            ..Default::default()
        };
        assert_eq!(config.max_age(), chrono::Duration::hours(12));
    }

    #[test]
    fn test_huge_max_age_saturates() {
        assert_eq!(days_to_duration(f64::MAX), chrono::Duration::MAX);
        assert_eq!(days_to_duration(1.0e8), chrono::Duration::days(100_000_000));
    }

    #[rstest]
    #[case(0.0)]
    #[case(-3.0)]
    #[case(f64::NAN)]
    fn test_validate_rejects_bad_age(#[case] days: f64) {
        let config = RetentionConfig {
            max_age_days: days,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_duplicate_owner() {
        let config: RetentionConfig = toml::from_str(
            r#"
            [[owners]]
            owner_id = "a"

            [[owners]]
            owner_id = "a"
        "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate owner_id"));
    }
}
