use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::ring::HashRing;
use crate::tracker::TrackerClient;

/// Endpoint handed to the transport: identity plus its call tracker.
pub type Endpoint = Arc<TrackerClient>;

/// Routing status of an endpoint inside one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Routable with reduced points
    Unhealthy,
    /// Held at a floor of points, ramping back up
    Recovering,
    /// Out of the ring, probed in the background
    Quarantined,
    /// Quarantine timed out; still probed, out until it recovers or is re-announced
    Evicted,
    /// Announced with weight 0, never routed
    Standby,
}

impl HealthStatus {
    pub fn is_routable(&self) -> bool {
        matches!(
            self,
            HealthStatus::Healthy | HealthStatus::Unhealthy | HealthStatus::Recovering
        )
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Recovering => "recovering",
            HealthStatus::Quarantined => "quarantined",
            HealthStatus::Evicted => "evicted",
            HealthStatus::Standby => "standby",
        };
        write!(f, "{}", s)
    }
}

/// Health of one endpoint as published in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointHealth {
    /// Strategy score in [0, 1], 1 being fully healthy
    pub score: f64,
    pub points: u32,
    pub status: HealthStatus,
}

/// An endpoint's membership in a partition
#[derive(Debug, Clone)]
pub struct Member {
    pub endpoint: Endpoint,
    pub weight: f64,
}

/// Input of a scoring pass: the partition's current members, already filtered
/// for banned URIs, sorted by URI.
#[derive(Debug, Clone)]
pub struct PartitionMembers {
    pub service: String,
    pub cluster: String,
    pub partition_id: u32,
    /// Membership generation of the cluster the list was built from
    pub generation: u64,
    pub members: Vec<Member>,
}

impl PartitionMembers {
    pub fn empty(service: &str, cluster: &str, partition_id: u32, generation: u64) -> Self {
        PartitionMembers {
            service: service.to_string(),
            cluster: cluster.to_string(),
            partition_id,
            generation,
            members: Vec::new(),
        }
    }

    /// Members that may receive traffic (positive weight)
    pub fn routable_count(&self) -> usize {
        self.members.iter().filter(|m| m.weight > 0.0).count()
    }
}

/// Partition-wide latency aggregate of the relative strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyAggregate {
    pub mean_ms: f64,
    pub stddev_ms: f64,
    /// Endpoints that contributed (those with traffic)
    pub contributors: usize,
}

/// Immutable view of a partition after a scoring pass. Rebuilds publish a new one.
#[derive(Debug)]
pub struct PartitionState {
    service: String,
    partition_id: u32,
    generation: u64,
    sequence: u64,
    rings: BTreeMap<String, Arc<HashRing<Endpoint>>>,
    health: BTreeMap<String, EndpointHealth>,
    override_drop_rate: f64,
    aggregate: Option<LatencyAggregate>,
    unhealthy_count: usize,
    quarantined_count: usize,
    total_points: usize,
    scored_at: Instant,
    calls_at_score: u64,
}

/// Bookkeeping of the scoring pass a snapshot comes from
#[derive(Debug, Clone, Copy)]
pub struct ScoreMark {
    pub sequence: u64,
    /// Time of the last full scoring pass
    pub scored_at: Instant,
    /// Completed calls of the members at the last full scoring pass
    pub calls_at_score: u64,
}

impl PartitionState {
    /// Builds the snapshot and one ring per scheme from the endpoints' points.
    pub fn build(
        members: &PartitionMembers,
        health: BTreeMap<String, EndpointHealth>,
        override_drop_rate: f64,
        aggregate: Option<LatencyAggregate>,
        mark: ScoreMark,
    ) -> Self {
        let mut by_scheme: BTreeMap<String, Vec<(Endpoint, u32)>> = BTreeMap::new();
        for member in &members.members {
            let points = health.get(member.endpoint.uri()).map(|h| h.points).unwrap_or(0);
            by_scheme
                .entry(member.endpoint.scheme().to_string())
                .or_default()
                .push((Arc::clone(&member.endpoint), points));
        }
        let rings: BTreeMap<String, Arc<HashRing<Endpoint>>> = by_scheme
            .into_iter()
            .map(|(scheme, weighted)| (scheme, Arc::new(HashRing::build(weighted))))
            .collect();

        let unhealthy_count = health
            .values()
            .filter(|h| matches!(h.status, HealthStatus::Unhealthy | HealthStatus::Recovering))
            .count();
        let quarantined_count = health
            .values()
            .filter(|h| matches!(h.status, HealthStatus::Quarantined | HealthStatus::Evicted))
            .count();
        let total_points = rings.values().map(|r| r.total_points()).sum();

        PartitionState {
            service: members.service.clone(),
            partition_id: members.partition_id,
            generation: members.generation,
            sequence: mark.sequence,
            rings,
            health,
            override_drop_rate: override_drop_rate.clamp(0.0, 1.0),
            aggregate,
            unhealthy_count,
            quarantined_count,
            total_points,
            scored_at: mark.scored_at,
            calls_at_score: mark.calls_at_score,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of the scoring pass that produced this snapshot
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn ring(&self, scheme: &str) -> Option<&Arc<HashRing<Endpoint>>> {
        self.rings.get(scheme)
    }

    pub fn rings(&self) -> &BTreeMap<String, Arc<HashRing<Endpoint>>> {
        &self.rings
    }

    pub fn health(&self) -> &BTreeMap<String, EndpointHealth> {
        &self.health
    }

    pub fn endpoint_health(&self, uri: &str) -> Option<&EndpointHealth> {
        self.health.get(uri)
    }

    pub fn points(&self, uri: &str) -> u32 {
        self.health.get(uri).map(|h| h.points).unwrap_or(0)
    }

    pub fn override_drop_rate(&self) -> f64 {
        self.override_drop_rate
    }

    pub fn aggregate(&self) -> Option<LatencyAggregate> {
        self.aggregate
    }

    pub fn unhealthy_count(&self) -> usize {
        self.unhealthy_count
    }

    pub fn quarantined_count(&self) -> usize {
        self.quarantined_count
    }

    pub fn total_points(&self) -> usize {
        self.total_points
    }

    pub fn endpoint_count(&self) -> usize {
        self.health.len()
    }

    /// Time of the last full scoring pass
    pub fn scored_at(&self) -> Instant {
        self.scored_at
    }

    pub fn calls_at_score(&self) -> u64 {
        self.calls_at_score
    }

    /// Same routing outcome: points and statuses of every endpoint plus the drop rate.
    pub fn same_routing(&self, other: &PartitionState) -> bool {
        self.override_drop_rate == other.override_drop_rate
            && self.health.len() == other.health.len()
            && self.health.iter().zip(other.health.iter()).all(|(a, b)| {
                a.0 == b.0 && a.1.points == b.1.points && a.1.status == b.1.status
            })
    }
}
