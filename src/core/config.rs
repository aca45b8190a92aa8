use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::errors::{CoordError, Result};

/// Coordinator configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    // Step scheduling
    /// Maximum number of steps executing concurrently
    pub max_parallel: usize,
    /// Default executor timeout, overridden by a contract's `timeout_secs`
    pub step_timeout_ms: u64,

    // Retrospects
    /// Size of the background retrospect worker pool
    pub retro_workers: usize,
    /// Default retrospect timeout, overridden by a spec's `timeout_secs`
    pub retro_timeout_ms: u64,

    // Gates
    /// How long a promotion gate waits for pending retrospects before the
    /// step is reported blocked
    pub promotion_wait_ms: u64,
    /// Automatic replans allowed per run
    pub max_replans: u32,

    // Budget
    pub enforce_limits: bool,

    /// Root directory `file_exists` resolves relative paths against
    pub sandbox_root: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            step_timeout_ms: 300_000, // 5 minutes
            retro_workers: 4,
            retro_timeout_ms: 600_000, // 10 minutes
            promotion_wait_ms: 0,
            max_replans: 2,
            enforce_limits: true,
            sandbox_root: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: CoordinatorConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(CoordError::configuration_field(
                "max_parallel must be greater than 0",
                "max_parallel",
            ));
        }
        if self.retro_workers == 0 {
            return Err(CoordError::configuration_field(
                "retro_workers must be greater than 0",
                "retro_workers",
            ));
        }
        if self.step_timeout_ms == 0 {
            return Err(CoordError::configuration_field(
                "step_timeout_ms must be greater than 0",
                "step_timeout_ms",
            ));
        }
        if self.retro_timeout_ms == 0 {
            return Err(CoordError::configuration_field(
                "retro_timeout_ms must be greater than 0",
                "retro_timeout_ms",
            ));
        }
        if self.promotion_wait_ms > self.retro_timeout_ms {
            return Err(CoordError::configuration_field(
                "promotion_wait_ms cannot exceed retro_timeout_ms",
                "promotion_wait_ms",
            ));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn retro_timeout(&self) -> Duration {
        Duration::from_millis(self.retro_timeout_ms)
    }

    pub fn promotion_wait(&self) -> Duration {
        Duration::from_millis(self.promotion_wait_ms)
    }

    /// Short timeouts for tests and demos
    pub fn development() -> Self {
        Self {
            max_parallel: 2,
            step_timeout_ms: 5_000,
            retro_workers: 2,
            retro_timeout_ms: 5_000,
            ..Default::default()
        }
    }
}

/// Whole milliseconds of a duration, saturating at `u64::MAX`
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Builder for CoordinatorConfig
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.config.max_parallel = max_parallel;
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.config.step_timeout_ms = millis(timeout);
        self
    }

    pub fn retro_workers(mut self, workers: usize) -> Self {
        self.config.retro_workers = workers;
        self
    }

    pub fn retro_timeout(mut self, timeout: Duration) -> Self {
        self.config.retro_timeout_ms = millis(timeout);
        self
    }

    /// Set how long promotion gates wait on unfinished retrospects
    pub fn promotion_wait(mut self, wait: Duration) -> Self {
        self.config.promotion_wait_ms = millis(wait);
        self
    }

    pub fn max_replans(mut self, max_replans: u32) -> Self {
        self.config.max_replans = max_replans;
        self
    }

    pub fn enforce_limits(mut self, enforce: bool) -> Self {
        self.config.enforce_limits = enforce;
        self
    }

    pub fn sandbox_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.sandbox_root = Some(root.into());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<CoordinatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
