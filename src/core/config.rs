//! core::config
//!
//! Configuration for collection names and timing constants.
//!
//! # Defaults
//!
//! | Setting                | Default             |
//! |------------------------|---------------------|
//! | `locks_collection`     | `overlock-locks`    |
//! | `jobs_collection`      | `overlock-jobs`     |
//! | `curators_collection`  | `overlock-curators` |
//! | `heartbeat_interval_ms`| 500                 |
//! | `heartbeat_timeout_ms` | 5000                |
//! | `inactivity_delay_ms`  | 3000                |
//! | `max_job_time_ms`      | 5000                |
//!
//! # Validation
//!
//! Config values are validated before use: intervals must be nonzero and the
//! heartbeat interval must be shorter than the heartbeat timeout, otherwise a
//! healthy curator could not refresh its own claim before it expired.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known key of the active-curator record in the curators collection.
pub const ACTIVE_CURATOR_KEY: &str = "active";

/// Errors from configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A config value is invalid.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Collection names and timing constants.
///
/// Timings are stored in milliseconds and exposed as [`Duration`] accessors.
/// Tests inject a scaled-down config instead of relying on the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Collection holding lock records.
    pub locks_collection: String,

    /// Collection holding job records (with embedded journals).
    pub jobs_collection: String,

    /// Collection holding the single active-curator record.
    pub curators_collection: String,

    /// How often an active or candidate curator refreshes its heartbeat.
    pub heartbeat_interval_ms: u64,

    /// Age after which another curator may seize the active-curator record.
    pub heartbeat_timeout_ms: u64,

    /// How long a losing candidate waits before trying again.
    pub inactivity_delay_ms: u64,

    /// Age after which an in-progress job is considered abandoned.
    pub max_job_time_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            locks_collection: "overlock-locks".to_string(),
            jobs_collection: "overlock-jobs".to_string(),
            curators_collection: "overlock-curators".to_string(),
            heartbeat_interval_ms: 500,
            heartbeat_timeout_ms: 5000,
            inactivity_delay_ms: 3000,
            max_job_time_ms: 5000,
        }
    }
}

impl Config {
    /// Validate the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any value is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("inactivity_delay_ms", self.inactivity_delay_ms),
            ("max_job_time_ms", self.max_job_time_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must be nonzero",
                    name
                )));
            }
        }

        if self.heartbeat_interval_ms >= self.heartbeat_timeout_ms {
            return Err(ConfigError::InvalidValue(format!(
                "heartbeat_interval_ms ({}) must be shorter than heartbeat_timeout_ms ({})",
                self.heartbeat_interval_ms, self.heartbeat_timeout_ms
            )));
        }

        for (name, value) in [
            ("locks_collection", &self.locks_collection),
            ("jobs_collection", &self.jobs_collection),
            ("curators_collection", &self.curators_collection),
        ] {
            if value.is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "{} must not be empty",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Heartbeat refresh interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat expiry window.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Back-off delay for losing candidates.
    pub fn inactivity_delay(&self) -> Duration {
        Duration::from_millis(self.inactivity_delay_ms)
    }

    /// Hard deadline for an in-progress job.
    pub fn max_job_time(&self) -> Duration {
        Duration::from_millis(self.max_job_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = Config::default();
        assert_eq!(config.locks_collection, "overlock-locks");
        assert_eq!(config.jobs_collection, "overlock-jobs");
        assert_eq!(config.curators_collection, "overlock-curators");
        assert_eq!(config.heartbeat_interval_ms, 500);
        assert_eq!(config.heartbeat_timeout_ms, 5000);
        assert_eq!(config.inactivity_delay_ms, 3000);
        assert_eq!(config.max_job_time_ms, 5000);
    }

    #[test]
    fn default_config_validates() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = Config {
            heartbeat_interval_ms: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn interval_must_be_shorter_than_timeout() {
        let config = Config {
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 5000,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn empty_collection_name_is_rejected() {
        let config = Config {
            jobs_collection: String::new(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn duration_accessors_convert_milliseconds() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(config.max_job_time(), Duration::from_millis(5000));
    }
}
