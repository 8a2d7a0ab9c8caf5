//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! none at all) yields a runnable broker. Durations use humantime syntax
//! (`100ms`, `20s`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// The file is not valid TOML for [`MasterConfig`].
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Path of the unix socket the broker listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Shared secret nodes authenticate with.
    ///
    /// Kept in the config file on purpose: admission is a plain secret
    /// comparison, not cryptographic authentication.
    #[serde(default)]
    pub secret: String,

    /// Per-read timeout applied to every accepted connection.
    ///
    /// Must be non-zero; the admission receive loop uses it to notice its
    /// per-entry budget elapsing.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Admission pipeline tunables.
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Tunables of the admission queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Inactive-entry count that triggers queue compaction.
    #[serde(default = "default_cutoff")]
    pub cutoff: usize,

    /// Receive budget each queue entry gets per worker pass.
    #[serde(default = "default_iterator_budget", with = "humantime_serde")]
    pub iterator_budget: Duration,

    /// How long a connection may sit unauthenticated before it is
    /// abandoned.
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// Upper bound on concurrent admission workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Sleep between overseer passes.
    #[serde(default = "default_overseer_period", with = "humantime_serde")]
    pub overseer_period: Duration,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/meridian/master.sock")
}

const fn default_read_timeout() -> Duration {
    Duration::from_millis(100)
}

const fn default_cutoff() -> usize {
    5
}

const fn default_iterator_budget() -> Duration {
    Duration::from_millis(100)
}

const fn default_grace_period() -> Duration {
    Duration::from_secs(20)
}

const fn default_max_workers() -> usize {
    3
}

const fn default_overseer_period() -> Duration {
    Duration::from_millis(200)
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            secret: String::new(),
            read_timeout: default_read_timeout(),
            admission: AdmissionConfig::default(),
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            cutoff: default_cutoff(),
            iterator_budget: default_iterator_budget(),
            grace_period: default_grace_period(),
            max_workers: default_max_workers(),
            overseer_period: default_overseer_period(),
        }
    }
}

impl MasterConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] when the file cannot be read,
    /// [`ConfigError::Parse`] when it is not valid configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: MasterConfig = toml::from_str("").unwrap();
        assert_eq!(config.admission.cutoff, 5);
        assert_eq!(config.admission.iterator_budget, Duration::from_millis(100));
        assert_eq!(config.admission.grace_period, Duration::from_secs(20));
        assert_eq!(config.admission.max_workers, 3);
        assert_eq!(config.admission.overseer_period, Duration::from_millis(200));
        assert_eq!(config.secret, "");
    }

    #[test]
    fn humantime_durations_parse() {
        let config: MasterConfig = toml::from_str(
            r#"
            socket_path = "/tmp/master.sock"
            secret = "hunter2"

            [admission]
            cutoff = 2
            iterator_budget = "50ms"
            grace_period = "1m"
            "#,
        )
        .unwrap();
        assert_eq!(config.admission.cutoff, 2);
        assert_eq!(config.admission.iterator_budget, Duration::from_millis(50));
        assert_eq!(config.admission.grace_period, Duration::from_secs(60));
        assert_eq!(config.secret, "hunter2");
    }
}
