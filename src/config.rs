//! Orchestrator configuration stored in ~/.autojoin/config.json.
//!
//! Every field has a default so a partial (or absent) file still yields a
//! usable config.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::retry::RetryPolicy;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "AUTOJOIN_CONFIG";

/// Upper bound for lead time, grace window and end buffer: one week.
const MAX_WINDOW_SECONDS: u64 = 7 * 24 * 60 * 60;
/// Upper bound for poll interval, attempt timeout and backoff: one hour.
const MAX_STEP_SECONDS: u64 = 60 * 60;
const MAX_JOIN_RETRIES: u32 = 20;
const MAX_BACKOFF_FACTOR: f64 = 10.0;
const MAX_DEAD_MAN_MULTIPLIER: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_lead_time_seconds")]
    pub lead_time_seconds: u64,
    #[serde(default = "default_grace_window_seconds")]
    pub grace_window_seconds: u64,
    #[serde(default = "default_max_join_retries")]
    pub max_join_retries: u32,
    #[serde(default = "default_retry_backoff_base_seconds")]
    pub retry_backoff_base_seconds: u64,
    #[serde(default = "default_retry_backoff_factor")]
    pub retry_backoff_factor: f64,
    #[serde(default = "default_retry_backoff_cap_seconds")]
    pub retry_backoff_cap_seconds: u64,
    #[serde(default = "default_join_attempt_timeout_seconds")]
    pub join_attempt_timeout_seconds: u64,
    #[serde(default = "default_join_worker_pool_size")]
    pub join_worker_pool_size: usize,
    #[serde(default = "default_recording_end_buffer_seconds")]
    pub recording_end_buffer_seconds: u64,
    #[serde(default = "default_dead_man_switch_multiplier")]
    pub dead_man_switch_multiplier: f64,
    /// SQLite file backing the event store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    /// Base URL of the meeting-bot service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_service_url: Option<String>,
    /// Base URL of the recorder service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorder_service_url: Option<String>,
}

fn default_poll_interval_seconds() -> u64 {
    30
}

fn default_lead_time_seconds() -> u64 {
    60
}

fn default_grace_window_seconds() -> u64 {
    300
}

fn default_max_join_retries() -> u32 {
    3
}

fn default_retry_backoff_base_seconds() -> u64 {
    5
}

fn default_retry_backoff_factor() -> f64 {
    2.0
}

fn default_retry_backoff_cap_seconds() -> u64 {
    60
}

fn default_join_attempt_timeout_seconds() -> u64 {
    30
}

fn default_join_worker_pool_size() -> usize {
    10
}

fn default_recording_end_buffer_seconds() -> u64 {
    600
}

fn default_dead_man_switch_multiplier() -> f64 {
    2.0
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            lead_time_seconds: default_lead_time_seconds(),
            grace_window_seconds: default_grace_window_seconds(),
            max_join_retries: default_max_join_retries(),
            retry_backoff_base_seconds: default_retry_backoff_base_seconds(),
            retry_backoff_factor: default_retry_backoff_factor(),
            retry_backoff_cap_seconds: default_retry_backoff_cap_seconds(),
            join_attempt_timeout_seconds: default_join_attempt_timeout_seconds(),
            join_worker_pool_size: default_join_worker_pool_size(),
            recording_end_buffer_seconds: default_recording_end_buffer_seconds(),
            dead_man_switch_multiplier: default_dead_man_switch_multiplier(),
            database_path: None,
            bot_service_url: None,
            recorder_service_url: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        let fail = |msg: &str| -> Result<(), OrchestratorError> {
            Err(OrchestratorError::ConfigurationError(msg.to_string()))
        };

        if self.poll_interval_seconds == 0 {
            return fail("pollIntervalSeconds must be greater than 0");
        }
        if self.join_worker_pool_size == 0 {
            return fail("joinWorkerPoolSize must be greater than 0");
        }
        if self.max_join_retries == 0 {
            return fail("maxJoinRetries must be at least 1");
        }
        if self.join_attempt_timeout_seconds == 0 {
            return fail("joinAttemptTimeoutSeconds must be greater than 0");
        }
        if self.retry_backoff_factor.is_nan() || self.retry_backoff_factor < 1.0 {
            return fail("retryBackoffFactor must be at least 1.0");
        }
        if self.dead_man_switch_multiplier.is_nan() || self.dead_man_switch_multiplier < 1.0 {
            return fail("deadManSwitchMultiplier must be at least 1.0");
        }
        if self.retry_backoff_cap_seconds < self.retry_backoff_base_seconds {
            return fail("retryBackoffCapSeconds must not be below retryBackoffBaseSeconds");
        }

        let limits = [
            ("pollIntervalSeconds", self.poll_interval_seconds, MAX_STEP_SECONDS),
            ("leadTimeSeconds", self.lead_time_seconds, MAX_WINDOW_SECONDS),
            ("graceWindowSeconds", self.grace_window_seconds, MAX_WINDOW_SECONDS),
            ("recordingEndBufferSeconds", self.recording_end_buffer_seconds, MAX_WINDOW_SECONDS),
            ("retryBackoffBaseSeconds", self.retry_backoff_base_seconds, MAX_STEP_SECONDS),
            ("retryBackoffCapSeconds", self.retry_backoff_cap_seconds, MAX_STEP_SECONDS),
            ("joinAttemptTimeoutSeconds", self.join_attempt_timeout_seconds, MAX_STEP_SECONDS),
        ];
        for (name, value, max) in limits {
            if value > max {
                return Err(OrchestratorError::ConfigurationError(format!(
                    "{} must be at most {}",
                    name, max
                )));
            }
        }
        if self.max_join_retries > MAX_JOIN_RETRIES {
            return fail("maxJoinRetries must be at most 20");
        }
        if self.retry_backoff_factor > MAX_BACKOFF_FACTOR {
            return fail("retryBackoffFactor must be at most 10.0");
        }
        if self.dead_man_switch_multiplier > MAX_DEAD_MAN_MULTIPLIER {
            return fail("deadManSwitchMultiplier must be at most 100.0");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn lead_time(&self) -> chrono::Duration {
        seconds(self.lead_time_seconds)
    }

    pub fn grace_window(&self) -> chrono::Duration {
        seconds(self.grace_window_seconds)
    }

    pub fn recording_end_buffer(&self) -> chrono::Duration {
        seconds(self.recording_end_buffer_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_join_retries,
            backoff_base: Duration::from_secs(self.retry_backoff_base_seconds),
            backoff_factor: self.retry_backoff_factor,
            backoff_cap: Duration::from_secs(self.retry_backoff_cap_seconds),
            attempt_timeout: Duration::from_secs(self.join_attempt_timeout_seconds),
        }
    }

    /// How long an event may sit in `joining` without a heartbeat before it
    /// counts as abandoned.
    pub fn dead_man_timeout(&self) -> chrono::Duration {
        let budget = self.retry_policy().total_budget().as_secs_f64();
        let millis = (budget * self.dead_man_switch_multiplier * 1000.0).round();
        if !millis.is_finite() || millis >= i64::MAX as f64 {
            return chrono::Duration::MAX;
        }
        chrono::Duration::try_milliseconds(millis.max(0.0) as i64).unwrap_or(chrono::Duration::MAX)
    }

    pub fn database_path(&self) -> Result<PathBuf, OrchestratorError> {
        match &self.database_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => Ok(state_dir()?.join("autojoin.db")),
        }
    }
}

/// Whole seconds as a chrono duration, saturating instead of wrapping.
fn seconds(value: u64) -> chrono::Duration {
    i64::try_from(value)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// `~/.autojoin`
pub fn state_dir() -> Result<PathBuf, OrchestratorError> {
    let home = dirs::home_dir().ok_or_else(|| {
        OrchestratorError::ConfigurationError("Could not find home directory".to_string())
    })?;
    Ok(home.join(".autojoin"))
}

/// Resolve the config path: `$AUTOJOIN_CONFIG`, else `~/.autojoin/config.json`.
pub fn config_path() -> Result<PathBuf, OrchestratorError> {
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(p) => Ok(PathBuf::from(p)),
        None => Ok(state_dir()?.join("config.json")),
    }
}

/// Load and validate the config. A missing file yields defaults.
pub fn load_config() -> Result<OrchestratorConfig, OrchestratorError> {
    let path = config_path()?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> Result<OrchestratorConfig, OrchestratorError> {
    if !path.exists() {
        log::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(OrchestratorConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|e| {
        OrchestratorError::ConfigurationError(format!("Failed to read config: {}", e))
    })?;

    let config: OrchestratorConfig = serde_json::from_str(&content).map_err(|e| {
        OrchestratorError::ConfigurationError(format!("Failed to parse config: {}", e))
    })?;

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{ "pollIntervalSeconds": 45, "maxJoinRetries": 5 }"#)
                .unwrap();
        assert_eq!(config.poll_interval_seconds, 45);
        assert_eq!(config.max_join_retries, 5);
        assert_eq!(config.lead_time_seconds, 60);
        assert_eq!(config.grace_window_seconds, 300);
        assert_eq!(config.join_worker_pool_size, 10);
        assert_eq!(config.recording_end_buffer_seconds, 600);
    }

    #[test]
    fn test_dead_man_timeout_is_twice_retry_budget() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.dead_man_timeout(), chrono::Duration::seconds(210));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_pool = OrchestratorConfig {
            join_worker_pool_size: 0,
            ..OrchestratorConfig::default()
        };
        assert!(zero_pool.validate().is_err());

        let shrinking = OrchestratorConfig {
            retry_backoff_factor: 0.5,
            ..OrchestratorConfig::default()
        };
        assert!(shrinking.validate().is_err());

        let inverted_cap = OrchestratorConfig {
            retry_backoff_base_seconds: 90,
            ..OrchestratorConfig::default()
        };
        assert!(inverted_cap.validate().is_err());

        assert!(OrchestratorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_bounds_every_duration() {
        let cases = [
            OrchestratorConfig {
                grace_window_seconds: 100_000_000_000_000_000,
                ..OrchestratorConfig::default()
            },
            OrchestratorConfig {
                grace_window_seconds: u64::MAX,
                ..OrchestratorConfig::default()
            },
            OrchestratorConfig {
                lead_time_seconds: MAX_WINDOW_SECONDS + 1,
                ..OrchestratorConfig::default()
            },
            OrchestratorConfig {
                join_attempt_timeout_seconds: MAX_STEP_SECONDS + 1,
                ..OrchestratorConfig::default()
            },
            OrchestratorConfig {
                dead_man_switch_multiplier: 1e300,
                ..OrchestratorConfig::default()
            },
            OrchestratorConfig {
                retry_backoff_factor: f64::INFINITY,
                ..OrchestratorConfig::default()
            },
            OrchestratorConfig {
                max_join_retries: 1_000,
                ..OrchestratorConfig::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(OrchestratorError::ConfigurationError(_))),
                "accepted {:?}",
                config
            );
        }

        let widest = OrchestratorConfig {
            grace_window_seconds: MAX_WINDOW_SECONDS,
            join_attempt_timeout_seconds: MAX_STEP_SECONDS,
            retry_backoff_cap_seconds: MAX_STEP_SECONDS,
            max_join_retries: MAX_JOIN_RETRIES,
            dead_man_switch_multiplier: MAX_DEAD_MAN_MULTIPLIER,
            ..OrchestratorConfig::default()
        };
        assert!(widest.validate().is_ok());
        assert!(widest.dead_man_timeout() > chrono::Duration::zero());
    }

    #[test]
    fn test_unvalidated_durations_saturate() {
        let config = OrchestratorConfig {
            grace_window_seconds: u64::MAX,
            lead_time_seconds: 100_000_000_000_000_000,
            join_attempt_timeout_seconds: u64::MAX,
            dead_man_switch_multiplier: 1e300,
            ..OrchestratorConfig::default()
        };
        assert_eq!(config.grace_window(), chrono::Duration::MAX);
        assert_eq!(config.lead_time(), chrono::Duration::MAX);
        assert_eq!(config.dead_man_timeout(), chrono::Duration::MAX);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&dir.path().join("absent.json")).expect("defaults");
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_invalid_file_is_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "joinWorkerPoolSize": 0 }"#).unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConfigurationError(_)));
    }
}
