//! Configuration for the reaper recovering expired leases
//!
//! - `REAPER_INTERVAL_SECONDS`: Pause between two recovery sweeps.
//! - `REAPER_BATCH_SIZE`: Maximum number of jobs recovered per statement.

use crate::errors::ConfigError;
use lease_queue_env_vars::var_parsed_or;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub batch_size: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            batch_size: 100,
        }
    }
}

impl ReaperConfig {
    pub fn from_environment() -> anyhow::Result<Self> {
        let default = Self::default();
        let interval = var_parsed_or("REAPER_INTERVAL_SECONDS", default.interval.as_secs())?;
        let batch_size = var_parsed_or("REAPER_BATCH_SIZE", default.batch_size)?;

        Ok(Self {
            interval: Duration::from_secs(interval),
            batch_size,
        })
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ZeroDuration("reaper interval"));
        }
        if self.batch_size < 1 {
            return Err(ConfigError::ZeroBatchSize);
        }
        Ok(())
    }
}
