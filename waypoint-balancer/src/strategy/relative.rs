use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::quarantine::{HealthProbe, ProbeOutcome, ProbeVerdict, QuarantineManager, QuarantineRecord};
use super::{LoadBalancerStrategy, PartitionTable, ScorePass, Scored, Scorer};
use crate::config::RelativeConfig;
use crate::listener::ListenerDispatcher;
use crate::partition_state::{
    Endpoint, EndpointHealth, HealthStatus, LatencyAggregate, PartitionMembers, PartitionState,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RelativeRecord {
    /// Health score in [0, 1]
    pub score: f64,
    /// Latency relative to the partition mean at the last pass
    pub factor: f64,
    pub last_unhealthy: bool,
    /// Doubling the score back up after leaving quarantine
    pub fast_recovery: bool,
    pub quarantine: Option<QuarantineRecord>,
}

impl RelativeRecord {
    fn new(score: f64) -> Self {
        RelativeRecord {
            score,
            factor: 1.0,
            last_unhealthy: false,
            fast_recovery: false,
            quarantine: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RelativeRecords {
    endpoints: HashMap<String, RelativeRecord>,
    aggregate: Option<LatencyAggregate>,
}

impl RelativeRecords {
    #[cfg(test)]
    pub fn record(&self, uri: &str) -> Option<&RelativeRecord> {
        self.endpoints.get(uri)
    }
}

/// How an endpoint compared to its partition over the last interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Unhealthy,
    Healthy,
    /// Too little traffic to judge
    Idle,
    Neutral,
}

/// Call weighted mean and standard deviation of the endpoints' latencies.
/// Each sample is `(latency_ms, calls)`; samples without calls are ignored.
fn latency_aggregate(samples: &[(f64, u64)]) -> Option<LatencyAggregate> {
    let samples: Vec<(f64, f64)> = samples
        .iter()
        .filter(|(latency, calls)| *calls > 0 && latency.is_finite())
        .map(|(latency, calls)| (*latency, *calls as f64))
        .collect();
    let total: f64 = samples.iter().map(|(_, w)| w).sum();
    if samples.is_empty() || total <= 0.0 {
        return None;
    }
    let mean = samples.iter().map(|(l, w)| l * w).sum::<f64>() / total;
    let variance = samples.iter().map(|(l, w)| w * (l - mean).powi(2)).sum::<f64>() / total;
    Some(LatencyAggregate {
        mean_ms: mean,
        stddev_ms: variance.sqrt(),
        contributors: samples.len(),
    })
}

struct RelativeScorer {
    config: RelativeConfig,
    quarantine: QuarantineManager,
}

impl RelativeScorer {
    fn initial_score(&self, endpoint: &Endpoint) -> f64 {
        if endpoint.do_not_slow_start() {
            1.0
        } else {
            self.config.initial_health_score
        }
    }

    fn step_score(&self, record: &mut RelativeRecord, verdict: Verdict) {
        let c = &self.config;
        match verdict {
            Verdict::Unhealthy => {
                record.score = (record.score - c.down_step).max(0.0);
                record.fast_recovery = false;
            }
            Verdict::Healthy | Verdict::Idle if record.score < 1.0 => {
                if record.fast_recovery && record.score < 0.5 {
                    record.score = if record.score > 0.0 {
                        record.score * 2.0
                    } else {
                        self.recovery_score()
                    };
                } else if c.slow_start_threshold > 0.0 && record.score < c.slow_start_threshold {
                    record.score = if record.score > 0.0 { record.score * 2.0 } else { 0.01 };
                } else {
                    record.score += c.up_step;
                }
                record.score = record.score.min(1.0);
                if record.score >= 0.5 {
                    record.fast_recovery = false;
                }
            }
            _ => {}
        }
        record.last_unhealthy = verdict == Verdict::Unhealthy;
    }

    /// Steps every routable endpoint against the partition mean and quarantines
    /// the worst offenders.
    fn full_pass(&self, records: &mut RelativeRecords, members: &PartitionMembers, now: Instant) {
        let c = &self.config;
        let stats: Vec<_> = members
            .members
            .iter()
            .filter(|m| m.weight > 0.0)
            .map(|m| (m, m.endpoint.snapshot()))
            .collect();

        let samples: Vec<(f64, u64)> = stats
            .iter()
            .filter(|(m, _)| {
                records
                    .endpoints
                    .get(m.endpoint.uri())
                    .map(|r| r.quarantine.is_none())
                    .unwrap_or(true)
            })
            .map(|(_, s)| (s.blended_latency_ms(), s.call_count + s.outstanding))
            .collect();
        let aggregate = latency_aggregate(&samples);
        records.aggregate = aggregate;
        let mean = aggregate.map(|a| a.mean_ms).unwrap_or(0.0);

        let mut candidates = Vec::new();
        for (member, s) in &stats {
            let uri = member.endpoint.uri();
            let Some(record) = records.endpoints.get_mut(uri) else {
                continue;
            };
            if record.quarantine.is_some() {
                continue;
            }
            let latency = s.blended_latency_ms();
            let error_rate = s.error_rate(c.load_balance_stream_errors);
            record.factor = if mean > 0.0 && s.has_traffic() {
                latency / mean
            } else {
                1.0
            };

            let enough_calls = s.call_count >= c.min_call_count.max(1);
            let verdict = if !enough_calls {
                Verdict::Idle
            } else if (mean > 0.0 && latency >= mean * c.relative_latency_high_threshold_factor)
                || error_rate >= c.high_error_rate
            {
                Verdict::Unhealthy
            } else if latency <= mean * c.relative_latency_low_threshold_factor
                && error_rate <= c.low_error_rate
            {
                Verdict::Healthy
            } else {
                Verdict::Neutral
            };
            self.step_score(record, verdict);

            if verdict == Verdict::Unhealthy
                && (record.factor >= c.quarantine.quarantine_factor || record.score <= 0.0)
            {
                candidates.push((uri.to_string(), record.factor));
            }
        }

        let already = records
            .endpoints
            .values()
            .filter(|r| r.quarantine.is_some())
            .count();
        let selected = self
            .quarantine
            .select(candidates, already, members.routable_count());
        for uri in selected {
            if let Some(record) = records.endpoints.get_mut(&uri) {
                info!(
                    service = %members.service,
                    partition_id = members.partition_id,
                    uri = %uri,
                    factor = record.factor,
                    score = record.score,
                    "quarantining endpoint"
                );
                record.quarantine = Some(QuarantineRecord::new(now));
            }
        }

        for record in records.endpoints.values_mut() {
            if let Some(q) = record.quarantine.as_mut() {
                self.quarantine.check_timeout(q, now);
            }
        }
    }

    /// Releases the best quarantined endpoint when nothing else is left to route to.
    fn ensure_routable(&self, records: &mut RelativeRecords, members: &PartitionMembers) {
        let routable: Vec<&str> = members
            .members
            .iter()
            .filter(|m| m.weight > 0.0)
            .map(|m| m.endpoint.uri())
            .collect();
        let any_free = routable.iter().any(|uri| {
            records
                .endpoints
                .get(*uri)
                .map(|r| r.quarantine.is_none())
                .unwrap_or(true)
        });
        if routable.is_empty() || any_free {
            return;
        }
        let best = routable
            .iter()
            .filter_map(|uri| records.endpoints.get(*uri).map(|r| (*uri, r)))
            .max_by(|a, b| {
                a.1.score
                    .total_cmp(&b.1.score)
                    .then_with(|| b.0.cmp(a.0))
            })
            .map(|(uri, _)| uri.to_string());
        if let Some(uri) = best {
            if let Some(record) = records.endpoints.get_mut(&uri) {
                warn!(
                    service = %members.service,
                    partition_id = members.partition_id,
                    uri = %uri,
                    "every endpoint quarantined, releasing the healthiest one"
                );
                self.release(record);
            }
        }
    }

    /// Score an endpoint restarts from when it leaves quarantine
    fn recovery_score(&self) -> f64 {
        if self.config.initial_recovery_score > 0.0 {
            self.config.initial_recovery_score
        } else {
            self.config.initial_health_score
        }
    }

    fn release(&self, record: &mut RelativeRecord) {
        record.quarantine = None;
        record.score = record.score.max(self.recovery_score());
        record.fast_recovery = true;
        record.last_unhealthy = false;
        record.factor = 1.0;
    }

    fn health_of(&self, record: &RelativeRecord, weight: f64) -> EndpointHealth {
        if weight <= 0.0 {
            return EndpointHealth {
                score: record.score,
                points: 0,
                status: HealthStatus::Standby,
            };
        }
        if let Some(q) = &record.quarantine {
            return EndpointHealth {
                score: record.score,
                points: 0,
                status: if q.evicted {
                    HealthStatus::Evicted
                } else {
                    HealthStatus::Quarantined
                },
            };
        }
        let relative = if record.factor > 0.0 {
            (1.0 / record.factor).min(1.0)
        } else {
            1.0
        };
        let points = (record.score * weight * self.config.points_per_weight as f64 * relative).round() as u32;
        EndpointHealth {
            score: record.score,
            points: points.max(1),
            status: if record.last_unhealthy {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Healthy
            },
        }
    }
}

impl Scorer for RelativeScorer {
    type Records = RelativeRecords;

    fn due(&self, current: &PartitionState, members: &PartitionMembers, now: Instant) -> Option<ScorePass> {
        if now.saturating_duration_since(current.scored_at()) >= self.config.update_interval() {
            return Some(ScorePass::Full);
        }
        if current.generation() != members.generation {
            return Some(ScorePass::Rebuild);
        }
        None
    }

    fn score(&self, records: &mut RelativeRecords, members: &PartitionMembers, pass: ScorePass, now: Instant) -> Scored {
        records
            .endpoints
            .retain(|uri, _| members.members.iter().any(|m| m.endpoint.uri() == uri));
        for member in &members.members {
            if !records.endpoints.contains_key(member.endpoint.uri()) {
                let score = self.initial_score(&member.endpoint);
                records
                    .endpoints
                    .insert(member.endpoint.uri().to_string(), RelativeRecord::new(score));
            }
        }

        if pass == ScorePass::Full {
            self.full_pass(records, members, now);
        }
        self.ensure_routable(records, members);

        let health = members
            .members
            .iter()
            .filter_map(|m| {
                records
                    .endpoints
                    .get(m.endpoint.uri())
                    .map(|r| (m.endpoint.uri().to_string(), self.health_of(r, m.weight)))
            })
            .collect::<BTreeMap<_, _>>();

        Scored {
            health,
            override_drop_rate: 0.0,
            aggregate: records.aggregate,
        }
    }
}

/// Relative strategy: endpoints are scored against the latency of their
/// partition peers, and outliers are taken out of the ring and probed until
/// they recover.
pub struct RelativeStrategy {
    scorer: RelativeScorer,
    partitions: PartitionTable<RelativeRecords>,
    probe: Arc<dyn HealthProbe>,
}

impl RelativeStrategy {
    pub fn new(config: RelativeConfig, events: ListenerDispatcher, probe: Arc<dyn HealthProbe>) -> Self {
        let quarantine = QuarantineManager::new(config.quarantine.clone());
        RelativeStrategy {
            scorer: RelativeScorer { config, quarantine },
            partitions: PartitionTable::new("relative", events),
            probe,
        }
    }

    pub fn config(&self) -> &RelativeConfig {
        &self.scorer.config
    }

    /// Probes the partition's quarantined endpoints that are due and applies the outcomes.
    async fn probe_partition(&self, members: &PartitionMembers) {
        let manager = &self.scorer.quarantine;
        let due = self
            .partitions
            .with_records(members.partition_id, |records| {
                let now = Instant::now();
                records
                    .endpoints
                    .iter()
                    .filter(|(_, r)| r.quarantine.as_ref().map(|q| manager.probe_due(q, now)).unwrap_or(false))
                    .map(|(uri, _)| uri.clone())
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap_or_default();

        let endpoints: Vec<&Endpoint> = members
            .members
            .iter()
            .filter(|m| due.iter().any(|uri| uri == m.endpoint.uri()))
            .map(|m| &m.endpoint)
            .collect();
        let outcomes: Vec<(String, ProbeOutcome)> = join_all(endpoints.into_iter().map(|endpoint| async move {
            (endpoint.uri().to_string(), self.probe.probe(endpoint).await)
        }))
        .await;

        let low_factor = self.scorer.config.relative_latency_low_threshold_factor;
        self.partitions
            .rebuild_with(&self.scorer, members, |records, now| {
                let mean = records.aggregate.map(|a| a.mean_ms).unwrap_or(0.0);
                let limit = manager.probe_latency_limit(mean, low_factor);
                let mut changed = false;
                for (uri, outcome) in outcomes {
                    let Some(record) = records.endpoints.get_mut(&uri) else {
                        continue;
                    };
                    let Some(q) = record.quarantine.as_mut() else {
                        continue;
                    };
                    if manager.apply_probe(q, outcome, limit, now) == ProbeVerdict::Recovered {
                        info!(
                            service = %members.service,
                            partition_id = members.partition_id,
                            uri = %uri,
                            evicted = q.evicted,
                            "endpoint recovered from quarantine"
                        );
                        self.scorer.release(record);
                        record.score = self.scorer.recovery_score();
                        changed = true;
                    }
                }
                for record in records.endpoints.values_mut() {
                    if let Some(q) = record.quarantine.as_mut() {
                        changed |= manager.check_timeout(q, now);
                    }
                }
                changed
            })
            .await;
    }

    #[cfg(test)]
    pub(crate) async fn record(&self, partition_id: u32, uri: &str) -> Option<RelativeRecord> {
        self.partitions
            .with_records(partition_id, |r| r.record(uri).cloned())
            .await
            .flatten()
    }
}

#[async_trait]
impl LoadBalancerStrategy for RelativeStrategy {
    fn name(&self) -> &'static str {
        "relative"
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
        let update = self.scorer.config.update_interval();
        if self.scorer.quarantine.config().enabled() {
            Some(update.min(self.scorer.quarantine.config().health_check_interval()))
        } else {
            Some(update)
        }
    }

    async fn on_quarantine_tick(&self, partitions: &[Arc<PartitionMembers>]) {
        for members in partitions {
            // interval scoring for partitions nobody is routing to
            self.partitions.get(&self.scorer, members);
            self.probe_partition(members).await;
        }
    }
}
