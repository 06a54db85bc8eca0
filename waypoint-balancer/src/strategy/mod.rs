use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::listener::{ListenerDispatcher, StateEvent};
use crate::partition_state::{
    EndpointHealth, HealthStatus, LatencyAggregate, PartitionMembers, PartitionState, ScoreMark,
};
use crate::properties::StrategyProperties;

mod degrader;
pub use degrader::DegraderStrategy;

mod quarantine;
pub use quarantine::{HealthProbe, NoopProbe, ProbeOutcome};

mod relative;
pub use relative::RelativeStrategy;

/// Scoring contract shared by the strategies.
///
/// `partition_state` is the hot path: it returns the current snapshot and, when a
/// pass is due and nobody else is scoring the partition, rescores inline. It never
/// waits on a lock. `update_partition` is the mutation path and always rebuilds.
#[async_trait]
pub trait LoadBalancerStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn partition_state(&self, members: &PartitionMembers) -> Arc<PartitionState>;

    async fn update_partition(&self, members: &PartitionMembers) -> Arc<PartitionState>;

    fn current_state(&self, partition_id: u32) -> Option<Arc<PartitionState>>;

    /// Forgets the partitions not listed
    fn retain_partitions(&self, partition_ids: &[u32]);

    /// Period of the background tick, `None` when the strategy needs none
    fn tick_interval(&self) -> Option<Duration>;

    /// Background work: interval scoring of idle partitions and quarantine probes.
    async fn on_quarantine_tick(&self, partitions: &[Arc<PartitionMembers>]);
}

/// Strategy instance of a service, selected by its properties.
pub enum Strategy {
    Degrader(DegraderStrategy),
    Relative(RelativeStrategy),
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Strategy({})", self.name())
    }
}

impl Strategy {
    pub fn from_properties(
        properties: &StrategyProperties,
        events: ListenerDispatcher,
        probe: Arc<dyn HealthProbe>,
    ) -> Self {
        match properties {
            StrategyProperties::Degrader(config) => {
                Strategy::Degrader(DegraderStrategy::new(config.clone(), events))
            }
            StrategyProperties::Relative(config) => {
                Strategy::Relative(RelativeStrategy::new(config.clone(), events, probe))
            }
        }
    }

    /// Whether the instance was built from these properties, so it can be kept
    /// across a service update.
    pub fn matches(&self, properties: &StrategyProperties) -> bool {
        match (self, properties) {
            (Strategy::Degrader(s), StrategyProperties::Degrader(c)) => s.config() == c,
            (Strategy::Relative(s), StrategyProperties::Relative(c)) => s.config() == c,
            _ => false,
        }
    }
}

#[async_trait]
impl LoadBalancerStrategy for Strategy {
    fn name(&self) -> &'static str {
        match self {
            Strategy::Degrader(s) => s.name(),
            Strategy::Relative(s) => s.name(),
        }
    }

    fn partition_state(&self, members: &PartitionMembers) -> Arc<PartitionState> {
        match self {
            Strategy::Degrader(s) => s.partition_state(members),
            Strategy::Relative(s) => s.partition_state(members),
        }
    }

    async fn update_partition(&self, members: &PartitionMembers) -> Arc<PartitionState> {
        match self {
            Strategy::Degrader(s) => s.update_partition(members).await,
            Strategy::Relative(s) => s.update_partition(members).await,
        }
    }

    fn current_state(&self, partition_id: u32) -> Option<Arc<PartitionState>> {
        match self {
            Strategy::Degrader(s) => s.current_state(partition_id),
            Strategy::Relative(s) => s.current_state(partition_id),
        }
    }

    fn retain_partitions(&self, partition_ids: &[u32]) {
        match self {
            Strategy::Degrader(s) => s.retain_partitions(partition_ids),
            Strategy::Relative(s) => s.retain_partitions(partition_ids),
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        match self {
            Strategy::Degrader(s) => s.tick_interval(),
            Strategy::Relative(s) => s.tick_interval(),
        }
    }

    async fn on_quarantine_tick(&self, partitions: &[Arc<PartitionMembers>]) {
        match self {
            Strategy::Degrader(s) => s.on_quarantine_tick(partitions).await,
            Strategy::Relative(s) => s.on_quarantine_tick(partitions).await,
        }
    }
}

/// Kind of scoring pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScorePass {
    /// Step every endpoint's health from its latest call statistics
    Full,
    /// Recompute points and statuses from the records, no health stepping
    Rebuild,
}

/// Outcome of a scoring pass, turned into a PartitionState by the table
pub(crate) struct Scored {
    pub health: BTreeMap<String, EndpointHealth>,
    pub override_drop_rate: f64,
    pub aggregate: Option<LatencyAggregate>,
}

/// The strategy specific half of a partition update.
pub(crate) trait Scorer: Send + Sync {
    type Records: Default + Send;

    /// Pass due for the partition at `now`, if any
    fn due(&self, current: &PartitionState, members: &PartitionMembers, now: Instant)
        -> Option<ScorePass>;

    fn score(
        &self,
        records: &mut Self::Records,
        members: &PartitionMembers,
        pass: ScorePass,
        now: Instant,
    ) -> Scored;
}

/// Completed calls of all members, the counter the call threshold compares against.
pub(crate) fn member_calls(members: &PartitionMembers) -> u64 {
    members
        .members
        .iter()
        .map(|m| m.endpoint.tracker().total_calls())
        .sum()
}

struct PartitionSlot<R> {
    snapshot: ArcSwap<PartitionState>,
    records: Mutex<R>,
}

/// Per-partition snapshots of one strategy instance.
///
/// Each slot pairs the published snapshot (swapped atomically, read without
/// locking) with the strategy's mutable records behind an async mutex. Only the
/// holder of that mutex produces the next snapshot.
pub(crate) struct PartitionTable<R> {
    strategy: &'static str,
    slots: DashMap<u32, Arc<PartitionSlot<R>>>,
    sequence: AtomicU64,
    events: ListenerDispatcher,
}

impl<R: Default + Send> PartitionTable<R> {
    pub fn new(strategy: &'static str, events: ListenerDispatcher) -> Self {
        PartitionTable {
            strategy,
            slots: DashMap::new(),
            sequence: AtomicU64::new(0),
            events,
        }
    }

    pub fn current(&self, partition_id: u32) -> Option<Arc<PartitionState>> {
        self.slots
            .get(&partition_id)
            .map(|slot| slot.snapshot.load_full())
    }

    pub fn retain(&self, partition_ids: &[u32]) {
        self.slots.retain(|id, _| partition_ids.contains(id));
    }

    pub fn partition_ids(&self) -> Vec<u32> {
        self.slots.iter().map(|e| *e.key()).collect()
    }

    /// Returns the slot of the partition, creating it with a rebuild pass when
    /// missing. The flag tells whether this call created it.
    fn slot<S>(&self, scorer: &S, members: &PartitionMembers, now: Instant) -> (Arc<PartitionSlot<R>>, bool)
    where
        S: Scorer<Records = R>,
    {
        if let Some(slot) = self.slots.get(&members.partition_id) {
            return (Arc::clone(&slot), false);
        }
        let mut created = false;
        let slot = self
            .slots
            .entry(members.partition_id)
            .or_insert_with(|| {
                created = true;
                let mut records = R::default();
                let scored = scorer.score(&mut records, members, ScorePass::Rebuild, now);
                let mark = ScoreMark {
                    sequence: self.next_sequence(),
                    scored_at: now,
                    calls_at_score: member_calls(members),
                };
                let state = Arc::new(self.build(members, scored, mark));
                self.announce(None, &state);
                Arc::new(PartitionSlot {
                    snapshot: ArcSwap::new(state),
                    records: Mutex::new(records),
                })
            })
            .clone();
        (slot, created)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn build(&self, members: &PartitionMembers, scored: Scored, mark: ScoreMark) -> PartitionState {
        PartitionState::build(
            members,
            scored.health,
            scored.override_drop_rate,
            scored.aggregate,
            mark,
        )
    }

    /// Hot path read with opportunistic rescoring.
    pub fn get<S>(&self, scorer: &S, members: &PartitionMembers) -> Arc<PartitionState>
    where
        S: Scorer<Records = R>,
    {
        let now = Instant::now();
        let (slot, _) = self.slot(scorer, members, now);
        let current = slot.snapshot.load_full();
        if scorer.due(&current, members, now).is_none() {
            return current;
        }
        let Ok(mut records) = slot.records.try_lock() else {
            // someone else is scoring this partition, serve the current snapshot
            return current;
        };
        let current = slot.snapshot.load_full();
        match scorer.due(&current, members, now) {
            Some(pass) => self.rescore(scorer, &slot, &mut records, &current, members, pass, now),
            None => current,
        }
    }

    /// Rebuild on the mutation path. A full pass is taken when one is due anyway.
    pub async fn update<S>(&self, scorer: &S, members: &PartitionMembers) -> Arc<PartitionState>
    where
        S: Scorer<Records = R>,
    {
        let now = Instant::now();
        let (slot, created) = self.slot(scorer, members, now);
        if created {
            return slot.snapshot.load_full();
        }
        let mut records = slot.records.lock().await;
        let current = slot.snapshot.load_full();
        let pass = match scorer.due(&current, members, now) {
            Some(ScorePass::Full) => ScorePass::Full,
            _ => ScorePass::Rebuild,
        };
        self.rescore(scorer, &slot, &mut records, &current, members, pass, now)
    }

    /// Runs `inspect` on the partition's records under its lock.
    pub async fn with_records<T>(&self, partition_id: u32, inspect: impl FnOnce(&mut R) -> T) -> Option<T> {
        let slot = self.slots.get(&partition_id).map(|s| Arc::clone(&s))?;
        let mut records = slot.records.lock().await;
        Some(inspect(&mut records))
    }

    /// Applies `change` to the records and publishes a rebuild when it reports a change.
    pub async fn rebuild_with<S>(
        &self,
        scorer: &S,
        members: &PartitionMembers,
        change: impl FnOnce(&mut R, Instant) -> bool,
    ) -> Option<Arc<PartitionState>>
    where
        S: Scorer<Records = R>,
    {
        let slot = self
            .slots
            .get(&members.partition_id)
            .map(|s| Arc::clone(&s))?;
        let mut records = slot.records.lock().await;
        let now = Instant::now();
        if !change(&mut records, now) {
            return None;
        }
        let current = slot.snapshot.load_full();
        Some(self.rescore(scorer, &slot, &mut records, &current, members, ScorePass::Rebuild, now))
    }

    #[allow(clippy::too_many_arguments)]
    fn rescore<S>(
        &self,
        scorer: &S,
        slot: &PartitionSlot<R>,
        records: &mut R,
        current: &Arc<PartitionState>,
        members: &PartitionMembers,
        pass: ScorePass,
        now: Instant,
    ) -> Arc<PartitionState>
    where
        S: Scorer<Records = R>,
    {
        let scored = scorer.score(records, members, pass, now);
        let mark = match pass {
            ScorePass::Full => ScoreMark {
                sequence: self.next_sequence(),
                scored_at: now,
                calls_at_score: member_calls(members),
            },
            ScorePass::Rebuild => ScoreMark {
                sequence: self.next_sequence(),
                scored_at: current.scored_at(),
                calls_at_score: current.calls_at_score(),
            },
        };
        let next = Arc::new(self.build(members, scored, mark));
        slot.snapshot.store(Arc::clone(&next));
        self.announce(Some(current), &next);
        next
    }

    /// Logs the update and emits the listener events it implies.
    fn announce(&self, previous: Option<&PartitionState>, next: &PartitionState) {
        let changed = match previous {
            None => true,
            Some(prev) => prev.generation() != next.generation() || !prev.same_routing(next),
        };

        if changed {
            info!(
                strategy = self.strategy,
                service = %next.service(),
                partition_id = next.partition_id(),
                generation = next.generation(),
                endpoints = next.endpoint_count(),
                total_points = next.total_points(),
                unhealthy = next.unhealthy_count(),
                quarantined = next.quarantined_count(),
                "partition ring rebuilt"
            );
            self.events.emit(StateEvent::RingRebuilt {
                service: next.service().to_string(),
                partition_id: next.partition_id(),
                generation: next.generation(),
                sequence: next.sequence(),
                total_points: next.total_points(),
                endpoint_count: next.endpoint_count(),
                unhealthy_count: next.unhealthy_count(),
                quarantined_count: next.quarantined_count(),
            });
        } else {
            debug!(
                strategy = self.strategy,
                service = %next.service(),
                partition_id = next.partition_id(),
                sequence = next.sequence(),
                "partition scored, routing unchanged"
            );
        }

        let previous_rate = previous.map(|p| p.override_drop_rate()).unwrap_or(0.0);
        if previous_rate != next.override_drop_rate() {
            if next.override_drop_rate() > previous_rate {
                warn!(
                    service = %next.service(),
                    partition_id = next.partition_id(),
                    previous = previous_rate,
                    current = next.override_drop_rate(),
                    "override drop rate raised"
                );
            } else {
                info!(
                    service = %next.service(),
                    partition_id = next.partition_id(),
                    previous = previous_rate,
                    current = next.override_drop_rate(),
                    "override drop rate lowered"
                );
            }
            self.events.emit(StateEvent::DropRateChanged {
                service: next.service().to_string(),
                partition_id: next.partition_id(),
                previous: previous_rate,
                current: next.override_drop_rate(),
            });
        }

        for (uri, health) in next.health() {
            let before = previous
                .and_then(|p| p.endpoint_health(uri))
                .map(|h| h.status)
                .unwrap_or(HealthStatus::Healthy);
            let quarantine_related = |s: HealthStatus| {
                matches!(s, HealthStatus::Quarantined | HealthStatus::Evicted)
            };
            if before != health.status
                && (quarantine_related(before) || quarantine_related(health.status))
            {
                info!(
                    service = %next.service(),
                    partition_id = next.partition_id(),
                    uri = %uri,
                    from = %before,
                    to = %health.status,
                    "quarantine transition"
                );
                self.events.emit(StateEvent::QuarantineTransition {
                    service: next.service().to_string(),
                    partition_id: next.partition_id(),
                    uri: uri.clone(),
                    from: before,
                    to: health.status,
                });
            }
        }
    }
}
