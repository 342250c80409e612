//! Configuration module for powertrail.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Configuration is read once at start-up and never re-read mid-run.

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Minute thresholds used by the staleness classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusThresholds {
    /// Samples at most this old count as online (default: 10)
    pub online_minutes: i64,
    /// Samples at most this old count as warning (default: 60)
    pub warning_minutes: i64,
    /// Samples older than this are treated as absent (default: 120)
    pub lookback_minutes: i64,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            online_minutes: 10,
            warning_minutes: 60,
            lookback_minutes: 120,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "powertrail.db")
    pub db_path: String,
    /// Raw samples older than this are deleted (default: 7)
    pub raw_retention_days: u32,
    /// Hourly buckets older than this are deleted (default: 3)
    pub hourly_retention_months: u32,
    pub status: StatusThresholds,
    /// Minimum consumption change in kWh worth persisting (default: 0.001)
    pub consumption_delta_kwh: f64,
    /// Price per kWh used when a user has no tariff configured (default: 0.32)
    pub fallback_rate: f64,
    /// Seconds between scheduled pipeline runs in serve mode (default: 3600)
    pub pipeline_interval_secs: u64,
    /// Lifetime of the run lease in seconds (default: 1800)
    pub lease_ttl_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "powertrail.db".to_string(),
            raw_retention_days: 7,
            hourly_retention_months: 3,
            status: StatusThresholds::default(),
            consumption_delta_kwh: 0.001,
            fallback_rate: 0.32,
            pipeline_interval_secs: 3600,
            lease_ttl_secs: 1800,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `POWERTRAIL_HTTP_PORT`: HTTP port (default: 8080)
    /// - `POWERTRAIL_DB_PATH`: Database file path (default: "powertrail.db")
    /// - `POWERTRAIL_RAW_RETENTION_DAYS`: Raw sample retention (default: 7)
    /// - `POWERTRAIL_HOURLY_RETENTION_MONTHS`: Hourly bucket retention (default: 3)
    /// - `POWERTRAIL_ONLINE_MINUTES`: Online threshold (default: 10)
    /// - `POWERTRAIL_WARNING_MINUTES`: Warning threshold (default: 60)
    /// - `POWERTRAIL_STATUS_LOOKBACK_MINUTES`: Status lookback (default: 120)
    /// - `POWERTRAIL_CONSUMPTION_DELTA_KWH`: Anti-thrash delta (default: 0.001)
    /// - `POWERTRAIL_FALLBACK_RATE`: Fallback tariff (default: 0.32)
    /// - `POWERTRAIL_PIPELINE_INTERVAL_SECS`: Pipeline interval (default: 3600)
    /// - `POWERTRAIL_LEASE_TTL_SECS`: Run lease lifetime (default: 1800)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("POWERTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        override_from_env("POWERTRAIL_HTTP_PORT", &mut cfg.http_port);
        override_from_env("POWERTRAIL_RAW_RETENTION_DAYS", &mut cfg.raw_retention_days);
        override_from_env(
            "POWERTRAIL_HOURLY_RETENTION_MONTHS",
            &mut cfg.hourly_retention_months,
        );
        override_from_env("POWERTRAIL_ONLINE_MINUTES", &mut cfg.status.online_minutes);
        override_from_env("POWERTRAIL_WARNING_MINUTES", &mut cfg.status.warning_minutes);
        override_from_env(
            "POWERTRAIL_STATUS_LOOKBACK_MINUTES",
            &mut cfg.status.lookback_minutes,
        );
        override_from_env(
            "POWERTRAIL_CONSUMPTION_DELTA_KWH",
            &mut cfg.consumption_delta_kwh,
        );
        override_from_env("POWERTRAIL_FALLBACK_RATE", &mut cfg.fallback_rate);
        override_from_env(
            "POWERTRAIL_PIPELINE_INTERVAL_SECS",
            &mut cfg.pipeline_interval_secs,
        );
        override_from_env("POWERTRAIL_LEASE_TTL_SECS", &mut cfg.lease_ttl_secs);

        cfg
    }

    /// Check that thresholds and retention windows are coherent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.status;
        if s.online_minutes < 0 || s.online_minutes >= s.warning_minutes {
            return Err(ConfigError::Invalid(format!(
                "online threshold {}m must be below warning threshold {}m",
                s.online_minutes, s.warning_minutes
            )));
        }
        if s.lookback_minutes <= s.warning_minutes {
            return Err(ConfigError::Invalid(format!(
                "status lookback {}m must exceed warning threshold {}m",
                s.lookback_minutes, s.warning_minutes
            )));
        }
        if self.raw_retention_days == 0 || self.hourly_retention_months == 0 {
            return Err(ConfigError::Invalid(
                "retention windows must be at least one unit".to_string(),
            ));
        }
        if !(self.consumption_delta_kwh >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "consumption delta {} must not be negative",
                self.consumption_delta_kwh
            )));
        }
        if !(self.fallback_rate >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "fallback rate {} must not be negative",
                self.fallback_rate
            )));
        }
        if self.lease_ttl_secs <= 0 {
            return Err(ConfigError::Invalid("lease TTL must be positive".to_string()));
        }
        Ok(())
    }
}

fn override_from_env<T: FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = env::var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!("Ignoring invalid value {:?} for {}", raw, key),
    }
}
