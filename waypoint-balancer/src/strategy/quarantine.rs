use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::QuarantineConfig;
use crate::partition_state::Endpoint;

/// Result of one health probe of a quarantined endpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Healthy { latency: Duration },
    Unhealthy,
    /// The probe could not be performed; the endpoint's probe streak is left as is
    Unknown,
}

/// Background health check of quarantined endpoints, supplied by the transport.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeOutcome;
}

/// Probe used when the embedding application supplies none. Never recovers anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProbe;

#[async_trait]
impl HealthProbe for NoopProbe {
    async fn probe(&self, _endpoint: &Endpoint) -> ProbeOutcome {
        ProbeOutcome::Unknown
    }
}

/// Probation bookkeeping of a quarantined endpoint
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QuarantineRecord {
    pub since: Instant,
    pub healthy_streak: u32,
    pub evicted: bool,
    pub last_probe: Option<Instant>,
}

impl QuarantineRecord {
    pub fn new(now: Instant) -> Self {
        QuarantineRecord {
            since: now,
            healthy_streak: 0,
            evicted: false,
            last_probe: None,
        }
    }
}

/// What a probe did to a quarantine record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProbeVerdict {
    Recovered,
    Pending,
}

/// Quarantine policy: how many endpoints may be on probation and when they leave it.
#[derive(Debug, Clone)]
pub(crate) struct QuarantineManager {
    config: QuarantineConfig,
}

impl QuarantineManager {
    pub fn new(config: QuarantineConfig) -> Self {
        QuarantineManager { config }
    }

    pub fn config(&self) -> &QuarantineConfig {
        &self.config
    }

    /// Most endpoints that may be out of the ring at once among `routable` members.
    /// Never the whole partition: at least one member stays routable.
    pub fn capacity(&self, routable: usize) -> usize {
        if !self.config.enabled() || routable < 2 {
            return 0;
        }
        let cap = (routable as f64 * self.config.max_percent).ceil() as usize;
        cap.min(routable - 1)
    }

    /// Picks the candidates to quarantine, worst relative factor first, within the
    /// room left by `already` quarantined endpoints.
    pub fn select(
        &self,
        mut candidates: Vec<(String, f64)>,
        already: usize,
        routable: usize,
    ) -> Vec<String> {
        let room = self.capacity(routable).saturating_sub(already);
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        candidates.into_iter().take(room).map(|(uri, _)| uri).collect()
    }

    /// Probe latency at or under which a probe counts as healthy.
    pub fn probe_latency_limit(&self, mean_latency_ms: f64, low_factor: f64) -> Duration {
        let relative = (mean_latency_ms * low_factor).max(0.0);
        let floor = self.config.min_probe_latency_ms as f64;
        Duration::from_millis(relative.max(floor).round() as u64)
    }

    /// Whether the record is due for a probe at `now`.
    pub fn probe_due(&self, record: &QuarantineRecord, now: Instant) -> bool {
        match record.last_probe {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.config.health_check_interval(),
        }
    }

    /// Moves a record whose probation ran out without recovery to evicted.
    /// Returns true on the transition.
    pub fn check_timeout(&self, record: &mut QuarantineRecord, now: Instant) -> bool {
        if record.evicted {
            return false;
        }
        if now.saturating_duration_since(record.since) >= self.config.quarantine_timeout() {
            record.evicted = true;
            return true;
        }
        false
    }

    pub fn apply_probe(
        &self,
        record: &mut QuarantineRecord,
        outcome: ProbeOutcome,
        latency_limit: Duration,
        now: Instant,
    ) -> ProbeVerdict {
        record.last_probe = Some(now);
        match outcome {
            ProbeOutcome::Healthy { latency } if latency <= latency_limit => {
                record.healthy_streak += 1;
            }
            ProbeOutcome::Healthy { .. } | ProbeOutcome::Unhealthy => {
                record.healthy_streak = 0;
            }
            ProbeOutcome::Unknown => {}
        }
        if record.healthy_streak >= self.config.healthy_probes_to_recover {
            ProbeVerdict::Recovered
        } else {
            ProbeVerdict::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_percent: f64) -> QuarantineManager {
        QuarantineManager::new(QuarantineConfig {
            max_percent,
            quarantine_timeout_ms: 10_000,
            ..QuarantineConfig::default()
        })
    }

    #[test]
    fn capacity_keeps_one_endpoint_routable() {
        let m = manager(1.0);
        assert_eq!(m.capacity(1), 0);
        assert_eq!(m.capacity(2), 1);
        assert_eq!(m.capacity(10), 9);

        let m = manager(0.1);
        assert_eq!(m.capacity(4), 1);
        assert_eq!(m.capacity(20), 2);

        assert_eq!(manager(0.0).capacity(10), 0);
    }

    #[test]
    fn select_prefers_the_worst_factor() {
        let m = manager(0.5);
        let picked = m.select(
            vec![
                ("http://a".to_string(), 3.5),
                ("http://b".to_string(), 9.0),
                ("http://c".to_string(), 4.0),
            ],
            0,
            4,
        );
        assert_eq!(picked, vec!["http://b".to_string(), "http://c".to_string()]);

        let picked = m.select(vec![("http://a".to_string(), 3.5)], 2, 4);
        assert!(picked.is_empty());
    }

    #[test]
    fn probe_limit_has_a_floor() {
        let m = manager(0.5);
        assert_eq!(m.probe_latency_limit(10.0, 1.2), Duration::from_millis(300));
        assert_eq!(m.probe_latency_limit(1000.0, 1.2), Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn streak_recovers_and_resets() {
        let m = manager(0.5);
        let limit = Duration::from_millis(300);
        let mut record = QuarantineRecord::new(Instant::now());
        let healthy = ProbeOutcome::Healthy {
            latency: Duration::from_millis(5),
        };

        for _ in 0..4 {
            assert_eq!(m.apply_probe(&mut record, healthy, limit, Instant::now()), ProbeVerdict::Pending);
        }
        m.apply_probe(&mut record, ProbeOutcome::Unknown, limit, Instant::now());
        assert_eq!(record.healthy_streak, 4);

        let slow = ProbeOutcome::Healthy {
            latency: Duration::from_millis(900),
        };
        m.apply_probe(&mut record, slow, limit, Instant::now());
        assert_eq!(record.healthy_streak, 0);

        for _ in 0..4 {
            m.apply_probe(&mut record, healthy, limit, Instant::now());
        }
        assert_eq!(m.apply_probe(&mut record, healthy, limit, Instant::now()), ProbeVerdict::Recovered);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_evicts_once() {
        let m = manager(0.5);
        let mut record = QuarantineRecord::new(Instant::now());
        assert!(!m.check_timeout(&mut record, Instant::now()));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(m.check_timeout(&mut record, Instant::now()));
        assert!(record.evicted);
        assert!(!m.check_timeout(&mut record, Instant::now()));
    }
}
