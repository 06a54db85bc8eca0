use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{BalancerError, Result};

/// Ring points one unit of announced weight may be worth.
pub const MAX_POINTS_PER_WEIGHT: u32 = 10_000;

/// Sliding window of the per-endpoint call trackers
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CallTrackerConfig {
    /// Number of buckets kept in the window
    pub bucket_count: usize,
    /// Width of one bucket (milliseconds)
    pub bucket_width_ms: u64,
}

impl Default for CallTrackerConfig {
    fn default() -> Self {
        Self {
            bucket_count: 5,
            bucket_width_ms: 1000,
        }
    }
}

impl CallTrackerConfig {
    pub fn bucket_width(&self) -> Duration {
        Duration::from_millis(self.bucket_width_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 || self.bucket_width_ms == 0 {
            return Err(BalancerError::Configuration(
                "call tracker needs at least one bucket of non-zero width".to_string(),
            ));
        }
        Ok(())
    }
}

/// Degrader strategy tunables.
///
/// The per-endpoint half (steps, latency and error thresholds, slow start) drives the
/// endpoint's computed drop rate, which in turn shrinks its share of the ring. The
/// water marks drive the service-wide override drop rate.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DegraderConfig {
    /// Ring points granted per unit of announced weight
    pub points_per_weight: u32,
    /// Minimum time between two scoring passes of a partition (milliseconds)
    pub update_interval_ms: u64,
    /// Disable the call count trigger, score only on interval or membership change
    pub update_only_at_interval: bool,
    /// Calls seen by a partition since its last scoring pass that force a new pass
    pub update_call_threshold: u64,

    pub up_step: f64,
    pub down_step: f64,
    pub min_call_count: u64,
    pub high_latency_ms: u64,
    pub low_latency_ms: u64,
    pub high_error_rate: f64,
    pub low_error_rate: f64,
    pub high_outstanding_ms: u64,
    pub low_outstanding_ms: u64,
    pub min_outstanding_count: u64,
    pub max_drop_rate: f64,
    /// Transmission rate under which recovery doubles instead of stepping (0 disables)
    pub slow_start_threshold: f64,
    /// Latency over `baseline * factor` counts as degrading (0 disables the trend check)
    pub latency_trend_factor: f64,
    /// Weight of the newest interval in the exponentially weighted latency baseline
    pub baseline_smoothing: f64,

    /// Share of full points an endpoint falling out of the ring is held at
    pub initial_recovery_level: f64,
    /// Growth of a recovering endpoint's points per interval while it gets no calls
    pub ring_ramp_factor: f64,

    /// Service average latency that raises the override drop rate (milliseconds)
    pub high_water_mark: f64,
    /// Service average latency under which the override drop rate is lowered (milliseconds)
    pub low_water_mark: f64,
    pub global_step_up: f64,
    pub global_step_down: f64,
    pub cluster_min_call_count_high_water_mark: u64,
    pub cluster_min_call_count_low_water_mark: u64,
}

impl Default for DegraderConfig {
    fn default() -> Self {
        Self {
            points_per_weight: 100,
            update_interval_ms: 5000,
            update_only_at_interval: false,
            update_call_threshold: 1000,
            up_step: 0.2,
            down_step: 0.2,
            min_call_count: 10,
            high_latency_ms: 3000,
            low_latency_ms: 500,
            high_error_rate: 1.1,
            low_error_rate: 1.1,
            high_outstanding_ms: 10000,
            low_outstanding_ms: 500,
            min_outstanding_count: 5,
            max_drop_rate: 1.0,
            slow_start_threshold: 0.0,
            latency_trend_factor: 0.0,
            baseline_smoothing: 0.3,
            initial_recovery_level: 0.01,
            ring_ramp_factor: 2.0,
            high_water_mark: 600.0,
            low_water_mark: 200.0,
            global_step_up: 0.2,
            global_step_down: 0.2,
            cluster_min_call_count_high_water_mark: 10,
            cluster_min_call_count_low_water_mark: 5,
        }
    }
}

impl DegraderConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(BalancerError::Configuration(format!(
                    "degrader {} must be within [0, 1], got {}",
                    name, v
                )));
            }
            Ok(())
        };
        unit("up_step", self.up_step)?;
        unit("down_step", self.down_step)?;
        unit("max_drop_rate", self.max_drop_rate)?;
        unit("slow_start_threshold", self.slow_start_threshold)?;
        unit("initial_recovery_level", self.initial_recovery_level)?;
        unit("global_step_up", self.global_step_up)?;
        unit("global_step_down", self.global_step_down)?;
        unit("baseline_smoothing", self.baseline_smoothing)?;

        if self.points_per_weight == 0 || self.points_per_weight > MAX_POINTS_PER_WEIGHT {
            return Err(BalancerError::Configuration(format!(
                "degrader points_per_weight must be in [1, {}]",
                MAX_POINTS_PER_WEIGHT
            )));
        }
        if self.update_interval_ms == 0 {
            return Err(BalancerError::Configuration(
                "degrader update_interval_ms must be positive".to_string(),
            ));
        }
        if self.low_latency_ms > self.high_latency_ms {
            return Err(BalancerError::Configuration(format!(
                "degrader low_latency_ms {} exceeds high_latency_ms {}",
                self.low_latency_ms, self.high_latency_ms
            )));
        }
        if self.low_water_mark > self.high_water_mark {
            return Err(BalancerError::Configuration(format!(
                "degrader low_water_mark {} exceeds high_water_mark {}",
                self.low_water_mark, self.high_water_mark
            )));
        }
        if self.ring_ramp_factor < 1.0 || self.latency_trend_factor < 0.0 {
            return Err(BalancerError::Configuration(
                "degrader ring_ramp_factor must be >= 1 and latency_trend_factor >= 0".to_string(),
            ));
        }
        if self.high_error_rate < 0.0 || self.low_error_rate < 0.0 {
            return Err(BalancerError::Configuration(
                "degrader error rates must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Quarantine parameters of the relative strategy
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QuarantineConfig {
    /// Largest share of a partition that may be quarantined at once (0 disables quarantine)
    pub max_percent: f64,
    /// Relative latency factor at which an endpoint is quarantined outright
    pub quarantine_factor: f64,
    /// Interval between two health probes of a quarantined endpoint (milliseconds)
    pub health_check_interval_ms: u64,
    /// Consecutive healthy probes needed to leave quarantine
    pub healthy_probes_to_recover: u32,
    /// Time in quarantine without recovering after which the endpoint is evicted (milliseconds)
    pub quarantine_timeout_ms: u64,
    /// Lower bound of the probe latency considered healthy (milliseconds)
    pub min_probe_latency_ms: u64,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            max_percent: 0.1,
            quarantine_factor: 3.0,
            health_check_interval_ms: 1000,
            healthy_probes_to_recover: 5,
            quarantine_timeout_ms: 30000,
            min_probe_latency_ms: 300,
        }
    }
}

impl QuarantineConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn quarantine_timeout(&self) -> Duration {
        Duration::from_millis(self.quarantine_timeout_ms)
    }

    pub fn enabled(&self) -> bool {
        self.max_percent > 0.0
    }
}

/// Relative strategy tunables
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RelativeConfig {
    pub points_per_weight: u32,
    /// Interval of the background scoring pass (milliseconds)
    pub update_interval_ms: u64,
    pub up_step: f64,
    pub down_step: f64,
    /// Endpoint latency over `mean * factor` is unhealthy
    pub relative_latency_high_threshold_factor: f64,
    /// Endpoint latency under `mean * factor` is healthy
    pub relative_latency_low_threshold_factor: f64,
    pub high_error_rate: f64,
    pub low_error_rate: f64,
    pub min_call_count: u64,
    /// Health score of a newly announced endpoint
    pub initial_health_score: f64,
    /// Score under which a healthy endpoint doubles its score instead of stepping
    pub slow_start_threshold: f64,
    /// Count stream errors toward the error rate
    pub load_balance_stream_errors: bool,
    /// Score an endpoint leaving quarantine restarts from, doubling until 0.5 (0 disables)
    pub initial_recovery_score: f64,
    pub quarantine: QuarantineConfig,
}

impl Default for RelativeConfig {
    fn default() -> Self {
        Self {
            points_per_weight: 100,
            update_interval_ms: 5000,
            up_step: 0.05,
            down_step: 0.2,
            relative_latency_high_threshold_factor: 1.3,
            relative_latency_low_threshold_factor: 1.2,
            high_error_rate: 1.1,
            low_error_rate: 1.1,
            min_call_count: 1,
            initial_health_score: 1.0,
            slow_start_threshold: 0.0,
            load_balance_stream_errors: false,
            initial_recovery_score: 0.01,
            quarantine: QuarantineConfig::default(),
        }
    }
}

impl RelativeConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(BalancerError::Configuration(format!(
                    "relative {} must be within [0, 1], got {}",
                    name, v
                )));
            }
            Ok(())
        };
        unit("up_step", self.up_step)?;
        unit("down_step", self.down_step)?;
        unit("initial_health_score", self.initial_health_score)?;
        unit("slow_start_threshold", self.slow_start_threshold)?;
        unit("initial_recovery_score", self.initial_recovery_score)?;
        unit("quarantine.max_percent", self.quarantine.max_percent)?;

        if self.points_per_weight == 0 || self.update_interval_ms == 0 {
            return Err(BalancerError::Configuration(
                "relative points_per_weight and update_interval_ms must be positive".to_string(),
            ));
        }
        if self.points_per_weight > MAX_POINTS_PER_WEIGHT {
            return Err(BalancerError::Configuration(format!(
                "relative points_per_weight {} exceeds {}",
                self.points_per_weight, MAX_POINTS_PER_WEIGHT
            )));
        }
        if self.relative_latency_high_threshold_factor < 1.0
            || self.relative_latency_low_threshold_factor < 1.0
            || self.relative_latency_low_threshold_factor
                > self.relative_latency_high_threshold_factor
        {
            return Err(BalancerError::Configuration(format!(
                "relative latency factors must satisfy 1 <= low ({}) <= high ({})",
                self.relative_latency_low_threshold_factor,
                self.relative_latency_high_threshold_factor
            )));
        }
        if self.quarantine.quarantine_factor < self.relative_latency_high_threshold_factor {
            return Err(BalancerError::Configuration(format!(
                "quarantine_factor {} must not be below the high threshold factor {}",
                self.quarantine.quarantine_factor, self.relative_latency_high_threshold_factor
            )));
        }
        if self.quarantine.healthy_probes_to_recover == 0
            || self.quarantine.health_check_interval_ms == 0
        {
            return Err(BalancerError::Configuration(
                "quarantine needs a positive probe count and health check interval".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of a LoadBalancerState instance
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    /// Events buffered for listeners before new ones are dropped
    pub listener_queue_capacity: usize,
    /// Commands buffered by the state executor
    pub executor_queue_capacity: usize,
    pub call_tracker: CallTrackerConfig,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            listener_queue_capacity: 1024,
            executor_queue_capacity: 1024,
            call_tracker: CallTrackerConfig::default(),
        }
    }
}

impl StateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listener_queue_capacity == 0 || self.executor_queue_capacity == 0 {
            return Err(BalancerError::Configuration(
                "state queues need a positive capacity".to_string(),
            ));
        }
        self.call_tracker.validate()
    }
}
