use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::model::{DAY_MS, MINUTE_MS, Ms};

/// Booking policy knobs. All of them are configuration, none are baked in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    /// A cancellation this close to class start counts as late.
    pub late_cancellation_cutoff_minutes: u32,
    pub restriction_duration_minutes: u32,
    pub strike_threshold: u32,
    pub rolling_window_days: u32,
    /// A CANCELLED tombstone blocks any later booking for the same class.
    pub block_reenroll_after_cancel: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            late_cancellation_cutoff_minutes: 120,
            restriction_duration_minutes: 1440,
            strike_threshold: 3,
            rolling_window_days: 30,
            block_reenroll_after_cancel: true,
        }
    }
}

impl PolicyConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let cfg = Self {
            late_cancellation_cutoff_minutes: env_or(
                "CLASSBOOK_LATE_CANCEL_CUTOFF_MINUTES",
                d.late_cancellation_cutoff_minutes,
            )?,
            restriction_duration_minutes: env_or(
                "CLASSBOOK_RESTRICTION_MINUTES",
                d.restriction_duration_minutes,
            )?,
            strike_threshold: env_or("CLASSBOOK_STRIKE_THRESHOLD", d.strike_threshold)?,
            rolling_window_days: env_or("CLASSBOOK_ROLLING_WINDOW_DAYS", d.rolling_window_days)?,
            block_reenroll_after_cancel: env_or(
                "CLASSBOOK_BLOCK_REENROLL_AFTER_CANCEL",
                d.block_reenroll_after_cancel,
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strike_threshold == 0 {
            return Err(ConfigError::Invalid("strike threshold must be at least 1"));
        }
        if self.rolling_window_days == 0 {
            return Err(ConfigError::Invalid("rolling window must be at least 1 day"));
        }
        if self.restriction_duration_minutes == 0 {
            return Err(ConfigError::Invalid("restriction duration must be positive"));
        }
        Ok(())
    }

    pub fn late_cutoff_ms(&self) -> Ms {
        Ms::from(self.late_cancellation_cutoff_minutes) * MINUTE_MS
    }

    pub fn restriction_ms(&self) -> Ms {
        Ms::from(self.restriction_duration_minutes) * MINUTE_MS
    }

    pub fn window_ms(&self) -> Ms {
        Ms::from(self.rolling_window_days) * DAY_MS
    }

    /// True if cancelling at `now` a class starting at `starts_at` is late.
    pub fn is_late_cancellation(&self, starts_at: Ms, now: Ms) -> bool {
        now >= starts_at.saturating_sub(self.late_cutoff_ms())
    }
}

/// Process-level settings for the server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub policy: PolicyConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let metrics_port = match std::env::var("CLASSBOOK_METRICS_PORT") {
            Ok(v) => Some(parse_value("CLASSBOOK_METRICS_PORT", &v)?),
            Err(_) => None,
        };
        Ok(Self {
            bind: std::env::var("CLASSBOOK_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("CLASSBOOK_PORT", 5480)?,
            data_dir: PathBuf::from(
                std::env::var("CLASSBOOK_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            max_connections: env_or("CLASSBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: env_or("CLASSBOOK_COMPACT_THRESHOLD", 1000)?,
            metrics_port,
            policy: PolicyConfig::from_env()?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("classbook.wal")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Parse { key: &'static str, value: String },
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::Invalid(msg) => write!(f, "invalid policy: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => parse_value(key, &v),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Parse {
        key,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PolicyConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.late_cutoff_ms(), 120 * MINUTE_MS);
        assert_eq!(cfg.window_ms(), 30 * DAY_MS);
    }

    #[test]
    fn zero_threshold_rejected() {
        let cfg = PolicyConfig { strike_threshold: 0, ..PolicyConfig::default() };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::Invalid("strike threshold must be at least 1"))
        );
    }

    #[test]
    fn late_cancellation_boundary() {
        let cfg = PolicyConfig::default();
        let start = 1_000 * MINUTE_MS;
        assert!(!cfg.is_late_cancellation(start, start - 121 * MINUTE_MS));
        assert!(cfg.is_late_cancellation(start, start - 120 * MINUTE_MS));
        assert!(cfg.is_late_cancellation(start, start - 10 * MINUTE_MS));
        assert!(cfg.is_late_cancellation(start, start + MINUTE_MS));
    }

    #[test]
    fn parse_value_reports_key() {
        let err = parse_value::<u32>("CLASSBOOK_STRIKE_THRESHOLD", "three").unwrap_err();
        assert!(err.to_string().contains("CLASSBOOK_STRIKE_THRESHOLD"));
        assert!(!parse_value::<bool>("X", " false ").unwrap());
    }
}
