//! Process-wide autoscaler configuration.
//!
//! Values here are read at the points that need them (sweep scheduling,
//! statistics cleanup, metric fetches, hostname generation) and are not owned
//! by any single group.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AutoscaleError, Result};

/// Longest hostname prefix accepted, leaving room for the group name.
pub const MAX_HOSTNAME_PREFIX_LEN: usize = 20;

/// Configuration for the autoscaler control loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    /// Period of the automatic "check all groups" sweep in seconds (0 disables it).
    pub stats_interval_secs: u64,
    /// Minimum age in seconds before statistics rows are purged.
    pub stats_cleanup_delay_secs: u64,
    /// Worker count of the bulk sweep.
    pub sweep_workers: usize,
    /// Capacity of the sweep's completion queue.
    pub sweep_queue_capacity: usize,
    /// Wait allowance in seconds for host and router metric calls.
    pub metrics_timeout_secs: u64,
    /// Prefix of generated VM hostnames.
    pub hostname_prefix: String,
    /// Quiet time in seconds used when a policy does not specify one.
    pub default_quiet_time_secs: u64,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
            stats_cleanup_delay_secs: 7200,
            sweep_workers: 10,
            sweep_queue_capacity: 100,
            metrics_timeout_secs: 30,
            hostname_prefix: "autoScaleVm-".to_string(),
            default_quiet_time_secs: 300,
        }
    }
}

impl AutoscaleConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| AutoscaleError::Config {
            reason: format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ),
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| AutoscaleError::Config {
            reason: format!("invalid TOML: {e}"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.sweep_workers == 0 {
            return Err(AutoscaleError::Config {
                reason: "sweep_workers must be at least 1".into(),
            });
        }
        if self.sweep_queue_capacity == 0 {
            return Err(AutoscaleError::Config {
                reason: "sweep_queue_capacity must be at least 1".into(),
            });
        }
        if self.metrics_timeout_secs == 0 {
            return Err(AutoscaleError::Config {
                reason: "metrics_timeout_secs must be positive".into(),
            });
        }
        if self.hostname_prefix.is_empty() || self.hostname_prefix.len() >= MAX_HOSTNAME_PREFIX_LEN {
            return Err(AutoscaleError::Config {
                reason: format!(
                    "hostname_prefix must be 1-{} characters",
                    MAX_HOSTNAME_PREFIX_LEN - 1
                ),
            });
        }
        if !self
            .hostname_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(AutoscaleError::Config {
                reason: "hostname_prefix may only contain ASCII letters, digits and '-'".into(),
            });
        }
        Ok(())
    }

    /// Returns the sweep period, or `None` when the periodic sweep is disabled.
    #[must_use]
    pub const fn stats_interval(&self) -> Option<Duration> {
        if self.stats_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.stats_interval_secs))
        }
    }

    /// Returns the statistics cleanup delay.
    #[must_use]
    pub const fn stats_cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.stats_cleanup_delay_secs)
    }

    /// Returns the metric fetch wait allowance.
    #[must_use]
    pub const fn metrics_timeout(&self) -> Duration {
        Duration::from_secs(self.metrics_timeout_secs)
    }

    /// Returns the default policy quiet time.
    #[must_use]
    pub const fn default_quiet_time(&self) -> Duration {
        Duration::from_secs(self.default_quiet_time_secs)
    }

    /// Set the sweep period in seconds (0 disables the periodic sweep).
    #[must_use]
    pub const fn with_stats_interval_secs(mut self, secs: u64) -> Self {
        self.stats_interval_secs = secs;
        self
    }

    /// Set the statistics cleanup delay in seconds.
    #[must_use]
    pub const fn with_stats_cleanup_delay_secs(mut self, secs: u64) -> Self {
        self.stats_cleanup_delay_secs = secs;
        self
    }

    /// Set the sweep worker count.
    #[must_use]
    pub const fn with_sweep_workers(mut self, workers: usize) -> Self {
        self.sweep_workers = workers;
        self
    }

    /// Set the metric fetch wait allowance in seconds.
    #[must_use]
    pub const fn with_metrics_timeout_secs(mut self, secs: u64) -> Self {
        self.metrics_timeout_secs = secs;
        self
    }

    /// Set the hostname prefix.
    #[must_use]
    pub fn with_hostname_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.hostname_prefix = prefix.into();
        self
    }
}
