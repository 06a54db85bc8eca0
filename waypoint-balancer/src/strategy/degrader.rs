use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use super::{member_calls, LoadBalancerStrategy, PartitionTable, ScorePass, Scored, Scorer};
use crate::config::DegraderConfig;
use crate::errors::{BalancerError, Result};
use crate::listener::ListenerDispatcher;
use crate::partition_state::{EndpointHealth, HealthStatus, PartitionMembers, PartitionState};
use crate::tracker::CallStats;

/// Per endpoint degrader state
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DegraderRecord {
    /// Computed drop rate in [0, max_drop_rate]; the endpoint keeps `1 - drop_rate` of its points
    pub drop_rate: f64,
    /// Exponentially weighted average of the endpoint's interval latencies
    pub baseline_ms: Option<f64>,
    /// Points held while the endpoint is in the recovery set
    pub recovery_points: Option<u32>,
    /// Completed calls seen at the previous pass, to tell idle endpoints apart
    pub seen_calls: u64,
    pub degraded: bool,
}

impl DegraderRecord {
    fn new(seen_calls: u64) -> Self {
        DegraderRecord {
            drop_rate: 0.0,
            baseline_ms: None,
            recovery_points: None,
            seen_calls,
            degraded: false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct DegraderRecords {
    endpoints: HashMap<String, DegraderRecord>,
    override_drop_rate: f64,
}

impl DegraderRecords {
    #[cfg(test)]
    pub fn record(&self, uri: &str) -> Option<&DegraderRecord> {
        self.endpoints.get(uri)
    }
}

struct DegraderScorer {
    config: DegraderConfig,
}

impl DegraderScorer {
    /// Steps the endpoint's drop rate from its latest statistics.
    /// Returns whether the endpoint looked degraded in this pass.
    fn step_endpoint(&self, uri: &str, record: &mut DegraderRecord, stats: &CallStats) -> Result<bool> {
        let c = &self.config;
        let latency = stats.avg_latency_ms;
        let error_rate = stats.error_rate(false);
        if !latency.is_finite() || !error_rate.is_finite() || !stats.outstanding_avg_latency_ms.is_finite() {
            return Err(BalancerError::StrategyInternal {
                endpoint: uri.to_string(),
                reason: format!("non finite statistics: latency {} error rate {}", latency, error_rate),
            });
        }

        let adjusted_min_calls = (((1.0 - record.drop_rate) * c.min_call_count as f64).round() as u64).max(1);
        let enough_calls = stats.call_count >= adjusted_min_calls;

        let trending = c.latency_trend_factor > 0.0
            && enough_calls
            && record
                .baseline_ms
                .map(|b| b > 0.0 && latency >= b * c.latency_trend_factor)
                .unwrap_or(false);
        let outstanding_high = stats.outstanding >= c.min_outstanding_count
            && stats.outstanding_avg_latency_ms >= c.high_outstanding_ms as f64;
        let outstanding_low = stats.outstanding < c.min_outstanding_count
            || stats.outstanding_avg_latency_ms <= c.low_outstanding_ms as f64;

        let high = (enough_calls
            && (latency >= c.high_latency_ms as f64 || error_rate >= c.high_error_rate || trending))
            || outstanding_high;
        let low = enough_calls
            && latency <= c.low_latency_ms as f64
            && error_rate <= c.low_error_rate
            && !trending
            && outstanding_low;

        if high {
            record.drop_rate = (record.drop_rate + c.up_step).min(c.max_drop_rate);
        } else if low && record.drop_rate > 0.0 {
            let transmission = 1.0 - record.drop_rate;
            if c.slow_start_threshold > 0.0 && transmission < c.slow_start_threshold {
                let next = if transmission > 0.0 {
                    transmission * 2.0
                } else {
                    c.down_step
                };
                record.drop_rate = (1.0 - next).max(0.0);
            } else {
                record.drop_rate = (record.drop_rate - c.down_step).max(0.0);
            }
        }

        if enough_calls {
            record.baseline_ms = Some(match record.baseline_ms {
                Some(b) => b * (1.0 - c.baseline_smoothing) + latency * c.baseline_smoothing,
                None => latency,
            });
        }
        Ok(high)
    }

    /// Points of the endpoint for its weight and drop rate, handling the recovery set.
    fn points(&self, record: &mut DegraderRecord, weight: f64, idle: bool) -> (u32, HealthStatus) {
        let c = &self.config;
        let full = ((weight * c.points_per_weight as f64).round() as u32).max(1);
        let computed = (weight * (1.0 - record.drop_rate) * c.points_per_weight as f64).round() as u32;

        if computed == 0 {
            let floor = ((weight * c.points_per_weight as f64 * c.initial_recovery_level).round() as u32).max(1);
            let points = match record.recovery_points {
                None => floor,
                // an endpoint nobody calls cannot prove itself, so its share ramps up
                Some(p) if idle => ((p as f64 * c.ring_ramp_factor).ceil() as u32).clamp(floor, full),
                Some(p) => p,
            };
            record.recovery_points = Some(points);
            return (points, HealthStatus::Recovering);
        }

        record.recovery_points = None;
        let status = if record.drop_rate > 0.0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };
        (computed, status)
    }

    /// Next override drop rate. Raised only when most endpoints degrade at once.
    fn override_drop_rate(&self, current: f64, calls: u64, avg_latency: f64, degraded: usize, routable: usize) -> f64 {
        let c = &self.config;
        let majority = routable > 0 && degraded * 2 > routable;
        if majority
            && calls >= c.cluster_min_call_count_high_water_mark
            && avg_latency >= c.high_water_mark
        {
            (current + c.global_step_up).min(1.0)
        } else if current > 0.0
            && (!majority
                || calls < c.cluster_min_call_count_low_water_mark
                || avg_latency <= c.low_water_mark)
        {
            (current - c.global_step_down).max(0.0)
        } else {
            current
        }
    }
}

impl Scorer for DegraderScorer {
    type Records = DegraderRecords;

    fn due(&self, current: &PartitionState, members: &PartitionMembers, now: Instant) -> Option<ScorePass> {
        let elapsed = now.saturating_duration_since(current.scored_at());
        if elapsed >= self.config.update_interval() {
            return Some(ScorePass::Full);
        }
        if !self.config.update_only_at_interval
            && member_calls(members).saturating_sub(current.calls_at_score())
                >= self.config.update_call_threshold
        {
            return Some(ScorePass::Full);
        }
        if current.generation() != members.generation {
            return Some(ScorePass::Rebuild);
        }
        None
    }

    fn score(&self, records: &mut DegraderRecords, members: &PartitionMembers, pass: ScorePass, _now: Instant) -> Scored {
        records
            .endpoints
            .retain(|uri, _| members.members.iter().any(|m| m.endpoint.uri() == uri));

        let mut health = BTreeMap::new();
        let mut degraded = 0usize;
        let mut routable = 0usize;
        let mut cluster_calls = 0u64;
        let mut latency_sum = 0.0;

        for member in &members.members {
            let uri = member.endpoint.uri();
            let total_calls = member.endpoint.tracker().total_calls();
            let record = records
                .endpoints
                .entry(uri.to_string())
                .or_insert_with(|| DegraderRecord::new(total_calls));

            if member.weight <= 0.0 {
                health.insert(
                    uri.to_string(),
                    EndpointHealth {
                        score: 1.0 - record.drop_rate,
                        points: 0,
                        status: HealthStatus::Standby,
                    },
                );
                continue;
            }
            routable += 1;

            let idle = total_calls == record.seen_calls;
            if pass == ScorePass::Full {
                let stats = member.endpoint.snapshot();
                record.degraded = match self.step_endpoint(uri, record, &stats) {
                    Ok(high) => high,
                    Err(e) => {
                        warn!(error = %e, service = %members.service, "degrader scoring failed, scoring endpoint pessimistically");
                        record.drop_rate = self.config.max_drop_rate;
                        true
                    }
                };
                record.seen_calls = total_calls;
                if stats.avg_latency_ms.is_finite() {
                    cluster_calls += stats.call_count;
                    latency_sum += stats.avg_latency_ms * stats.call_count as f64;
                }
            }
            if record.degraded || record.drop_rate > 0.0 {
                degraded += 1;
            }

            // rebuilds keep a recovery hold where it is
            let (points, status) = self.points(record, member.weight, pass == ScorePass::Full && idle);
            health.insert(
                uri.to_string(),
                EndpointHealth {
                    score: 1.0 - record.drop_rate,
                    points,
                    status,
                },
            );
        }

        if pass == ScorePass::Full {
            let avg_latency = if cluster_calls > 0 {
                latency_sum / cluster_calls as f64
            } else {
                0.0
            };
            records.override_drop_rate = self.override_drop_rate(
                records.override_drop_rate,
                cluster_calls,
                avg_latency,
                degraded,
                routable,
            );
        }

        Scored {
            health,
            override_drop_rate: records.override_drop_rate,
            aggregate: None,
        }
    }
}

/// Degrader strategy: every endpoint is scored against its own latency and error
/// trend, and the service sheds calls through an override drop rate when most of
/// its endpoints degrade together.
pub struct DegraderStrategy {
    scorer: DegraderScorer,
    partitions: PartitionTable<DegraderRecords>,
}

impl DegraderStrategy {
    pub fn new(config: DegraderConfig, events: ListenerDispatcher) -> Self {
        DegraderStrategy {
            scorer: DegraderScorer { config },
            partitions: PartitionTable::new("degrader", events),
        }
    }

    pub fn config(&self) -> &DegraderConfig {
        &self.scorer.config
    }

    #[cfg(test)]
    pub(crate) async fn record(&self, partition_id: u32, uri: &str) -> Option<DegraderRecord> {
        self.partitions
            .with_records(partition_id, |r| r.record(uri).cloned())
            .await
            .flatten()
    }
}

#[async_trait]
impl LoadBalancerStrategy for DegraderStrategy {
    fn name(&self) -> &'static str {
        "degrader"
    }

    fn partition_state(&self, members: &PartitionMembers) -> Arc<PartitionState> {
        self.partitions.get(&self.scorer, members)
    }

    async fn update_partition(&self, members: &PartitionMembers) -> Arc<PartitionState> {
        self.partitions.update(&self.scorer, members).await
    }

    fn current_state(&self, partition_id: u32) -> Option<Arc<PartitionState>> {
        self.partitions.current(partition_id)
    }

    fn retain_partitions(&self, partition_ids: &[u32]) {
        self.partitions.retain(partition_ids);
    }

    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    async fn on_quarantine_tick(&self, _partitions: &[Arc<PartitionMembers>]) {}
}
