//! Application configuration.
//!
//! Engine timings default to the reference behavior (30 s reconciliation
//! tick, hourly sweep, 24 h ceiling, 4 s stop grace, 30 s stall timeout,
//! 5 s retry delay with a 60 s cooldown, daily purge) and are validated at
//! startup. Retention settings live in the settings record instead, because
//! they are re-read on every cleanup cycle.

use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Top-level application configuration, sourced from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub recordings_root: PathBuf,
    pub log_dir: PathBuf,
    /// Terminal-write journal location.
    pub journal_path: PathBuf,
    pub ffmpeg_path: String,
    pub tick_interval: Duration,
    pub sweep_interval: Duration,
    pub max_recording_duration: Duration,
    pub grace_period: Duration,
    pub stall_timeout: Duration,
    pub retry_delay: Duration,
    pub retry_cooldown: Duration,
    pub purge_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:nvr.db?mode=rwc".to_string(),
            recordings_root: PathBuf::from("./recordings"),
            log_dir: PathBuf::from("./logs"),
            journal_path: PathBuf::from("./nvr-journal.jsonl"),
            ffmpeg_path: "ffmpeg".to_string(),
            tick_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60 * 60),
            max_recording_duration: Duration::from_secs(24 * 60 * 60),
            grace_period: Duration::from_secs(4),
            stall_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            retry_cooldown: Duration::from_secs(60),
            purge_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl AppConfig {
    /// Build the configuration from environment variables, validating the
    /// result.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            database_url: env_string("DATABASE_URL", &defaults.database_url),
            recordings_root: PathBuf::from(env_string(
                "NVR_RECORDINGS_ROOT",
                &defaults.recordings_root.to_string_lossy(),
            )),
            log_dir: PathBuf::from(env_string(
                "NVR_LOG_DIR",
                &defaults.log_dir.to_string_lossy(),
            )),
            journal_path: PathBuf::from(env_string(
                "NVR_JOURNAL_PATH",
                &defaults.journal_path.to_string_lossy(),
            )),
            ffmpeg_path: env_string("NVR_FFMPEG_PATH", &defaults.ffmpeg_path),
            tick_interval: env_duration_secs("NVR_TICK_INTERVAL_SECS", defaults.tick_interval)?,
            sweep_interval: env_duration_secs("NVR_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            max_recording_duration: env_duration_secs(
                "NVR_MAX_RECORDING_SECS",
                defaults.max_recording_duration,
            )?,
            grace_period: env_duration_secs("NVR_STOP_GRACE_SECS", defaults.grace_period)?,
            stall_timeout: env_duration_secs("NVR_STALL_TIMEOUT_SECS", defaults.stall_timeout)?,
            retry_delay: env_duration_secs("NVR_RETRY_DELAY_SECS", defaults.retry_delay)?,
            retry_cooldown: env_duration_secs("NVR_RETRY_COOLDOWN_SECS", defaults.retry_cooldown)?,
            purge_interval: env_duration_secs("NVR_PURGE_INTERVAL_SECS", defaults.purge_interval)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(Error::config("database URL must not be empty"));
        }
        if self.ffmpeg_path.trim().is_empty() {
            return Err(Error::config("ffmpeg path must not be empty"));
        }
        for (name, duration) in [
            ("tick interval", self.tick_interval),
            ("sweep interval", self.sweep_interval),
            ("max recording duration", self.max_recording_duration),
            ("grace period", self.grace_period),
            ("stall timeout", self.stall_timeout),
            ("retry cooldown", self.retry_cooldown),
            ("purge interval", self.purge_interval),
        ] {
            if duration.is_zero() {
                return Err(Error::config(format!("{name} must be non-zero")));
            }
        }
        if self.max_recording_duration < self.tick_interval {
            return Err(Error::config(
                "max recording duration must exceed the tick interval",
            ));
        }
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration_secs(key: &str, default: Duration) -> Result<Duration> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::config(format!("{key} must be an integer number of seconds"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_duration_rejected() {
        let mut config = AppConfig::default();
        config.tick_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ceiling_must_exceed_tick() {
        let mut config = AppConfig::default();
        config.max_recording_duration = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }
}
