use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{DiscoveryError, Result};

/// Settings of the store bridge and of the announcer
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// First delay before re-opening the watches after the feed closed (milliseconds)
    pub reconnect_backoff_initial_ms: u64,
    /// Upper bound of the doubling reconnect delay (milliseconds)
    pub reconnect_backoff_max_ms: u64,
    pub stale_check_interval_ms: u64,
    /// How long the feed may stay disconnected before the state is flagged stale (milliseconds)
    pub stale_threshold_ms: u64,
    /// Lease of an announced URI (milliseconds)
    pub announce_ttl_ms: u64,
    pub keep_alive_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff_initial_ms: 100,
            reconnect_backoff_max_ms: 5000,
            stale_check_interval_ms: 1000,
            stale_threshold_ms: 5000,
            announce_ttl_ms: 10000,
            keep_alive_interval_ms: 3000,
        }
    }
}

impl DiscoveryConfig {
    pub fn reconnect_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_initial_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_millis(self.stale_check_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn announce_ttl(&self) -> Duration {
        Duration::from_millis(self.announce_ttl_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reconnect_backoff_initial_ms == 0
            || self.stale_check_interval_ms == 0
            || self.keep_alive_interval_ms == 0
        {
            return Err(DiscoveryError::Configuration(
                "intervals must be positive".to_string(),
            ));
        }
        if self.reconnect_backoff_max_ms < self.reconnect_backoff_initial_ms {
            return Err(DiscoveryError::Configuration(format!(
                "reconnect backoff max {}ms is below the initial {}ms",
                self.reconnect_backoff_max_ms, self.reconnect_backoff_initial_ms
            )));
        }
        if self.keep_alive_interval_ms >= self.announce_ttl_ms {
            return Err(DiscoveryError::Configuration(format!(
                "keep alive interval {}ms must be shorter than the announce ttl {}ms",
                self.keep_alive_interval_ms, self.announce_ttl_ms
            )));
        }
        Ok(())
    }
}
