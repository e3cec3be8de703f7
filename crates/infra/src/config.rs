//! Store configuration, read from the process environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const MAX_CONNECTIONS: &str = "STRATA_MAX_CONNECTIONS";
pub const ACQUIRE_TIMEOUT_SECS: &str = "STRATA_ACQUIRE_TIMEOUT_SECS";
pub const ARCHIVE_AFTER_DAYS: &str = "STRATA_ARCHIVE_AFTER_DAYS";
pub const MAINTENANCE_INTERVAL_SECS: &str = "STRATA_MAINTENANCE_INTERVAL_SECS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}='{value}' is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} is not set")]
    Missing(&'static str),
}

/// Connection and maintenance settings for the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `None` selects the in-memory backends.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Events older than this move from the active to the archived bucket.
    pub archive_after_days: u32,
    pub maintenance_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            acquire_timeout_secs: 5,
            archive_after_days: 30,
            maintenance_interval_secs: 3600,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from an arbitrary variable source (unset values keep defaults).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            database_url: lookup(DATABASE_URL).filter(|url| !url.trim().is_empty()),
            max_connections: parse_var(&lookup, MAX_CONNECTIONS, defaults.max_connections)?,
            acquire_timeout_secs: parse_var(
                &lookup,
                ACQUIRE_TIMEOUT_SECS,
                defaults.acquire_timeout_secs,
            )?,
            archive_after_days: parse_var(&lookup, ARCHIVE_AFTER_DAYS, defaults.archive_after_days)?,
            maintenance_interval_secs: parse_var(
                &lookup,
                MAINTENANCE_INTERVAL_SECS,
                defaults.maintenance_interval_secs,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            (MAX_CONNECTIONS, u64::from(self.max_connections)),
            (ARCHIVE_AFTER_DAYS, u64::from(self.archive_after_days)),
            (MAINTENANCE_INTERVAL_SECS, self.maintenance_interval_secs),
        ];
        for (var, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    var,
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing(DATABASE_URL))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn archive_after(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.archive_after_days))
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
