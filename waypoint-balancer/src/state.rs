use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::StateConfig;
use crate::errors::{BalancerError, Result};
use crate::listener::{ListenerDispatcher, StateEvent, StateListener};
use crate::partition::{PartitionAccessor, Route};
use crate::partition_state::{Endpoint, Member, PartitionMembers, PartitionState};
use crate::properties::{ClusterProperties, ServiceProperties, UriAnnouncement};
use crate::ring::HashRing;
use crate::strategy::{HealthProbe, LoadBalancerStrategy, NoopProbe, Strategy};
use crate::tracker::{CallTracker, TrackerClient};

/// Lifecycle of a LoadBalancerState
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    /// First snapshot load in flight
    Initializing,
    /// Serving from snapshots and accepting incremental updates
    Steady,
    /// Mutations are refused, listeners are drained
    ShuttingDown,
    Stopped,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Uninitialized,
            1 => Lifecycle::Initializing,
            2 => Lifecycle::Steady,
            3 => Lifecycle::ShuttingDown,
            _ => Lifecycle::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Lifecycle::Uninitialized => 0,
            Lifecycle::Initializing => 1,
            Lifecycle::Steady => 2,
            Lifecycle::ShuttingDown => 3,
            Lifecycle::Stopped => 4,
        }
    }

    pub fn accepts_mutations(&self) -> bool {
        !matches!(self, Lifecycle::ShuttingDown | Lifecycle::Stopped)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Initializing => "initializing",
            Lifecycle::Steady => "steady",
            Lifecycle::ShuttingDown => "shutting_down",
            Lifecycle::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Announcement feed change for one URI of a cluster
#[derive(Debug, Clone, PartialEq)]
pub enum UriChange {
    Add(UriAnnouncement),
    Remove(String),
}

/// Full content of the coordination store, applied on bootstrap and resync.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub clusters: Vec<ClusterProperties>,
    pub services: Vec<ServiceProperties>,
    /// Announcements per cluster name
    pub uris: BTreeMap<String, Vec<UriAnnouncement>>,
}

/// Summary of the state for observability
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateStats {
    pub version: u64,
    pub lifecycle: Lifecycle,
    pub stale: bool,
    pub clusters: usize,
    pub services: usize,
    pub endpoints: usize,
    pub dropped_events: u64,
}

/// Keys of one host, grouped by partition
#[derive(Debug, Clone)]
pub struct HostKeys {
    pub endpoint: Endpoint,
    pub partitions: BTreeMap<u32, Vec<String>>,
}

impl HostKeys {
    pub fn key_count(&self) -> usize {
        self.partitions.values().map(Vec::len).sum()
    }
}

/// A batch of keys split by the host each key routes to, for scatter-gather calls.
#[derive(Debug, Clone, Default)]
pub struct KeyMapping {
    /// Keyed by host URI
    pub hosts: BTreeMap<String, HostKeys>,
    /// Keys whose partition has no routable endpoint, per partition
    pub unmapped: BTreeMap<u32, Vec<String>>,
    /// Keys the cluster's partitioning rejects
    pub unroutable: Vec<String>,
}

impl KeyMapping {
    pub fn mapped_count(&self) -> usize {
        self.hosts.values().map(HostKeys::key_count).sum()
    }
}

#[derive(Debug, Clone)]
struct ClusterEntry {
    properties: Arc<ClusterProperties>,
    accessor: PartitionAccessor,
}

#[derive(Debug, Clone)]
struct Announced {
    announcement: Arc<UriAnnouncement>,
    endpoint: Endpoint,
}

/// Announced endpoints of a cluster
#[derive(Debug, Clone, Default)]
struct UriSet {
    /// Bumped on every membership or partitioning change of the cluster
    generation: u64,
    endpoints: BTreeMap<String, Announced>,
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    properties: Arc<ServiceProperties>,
    strategy: Arc<Strategy>,
    /// Members of every partition that has at least one
    partitions: BTreeMap<u32, Arc<PartitionMembers>>,
}

/// Immutable registry published through the state's ArcSwap.
#[derive(Debug, Clone, Default)]
struct Registry {
    clusters: BTreeMap<String, ClusterEntry>,
    uris: BTreeMap<String, UriSet>,
    services: BTreeMap<String, ServiceEntry>,
}

impl Registry {
    /// Partition members of a service from its cluster's announcements, bans applied.
    fn members_for(&self, service: &ServiceProperties) -> BTreeMap<u32, Arc<PartitionMembers>> {
        let Some(uris) = self.uris.get(&service.cluster_name) else {
            return BTreeMap::new();
        };
        let cluster = self.clusters.get(&service.cluster_name);
        let partition_count = cluster.map(|c| c.accessor.partition_count()).unwrap_or(1);
        let banned = |uri: &str| {
            service.banned_uris.contains(uri)
                || cluster
                    .map(|c| c.properties.banned_uris.contains(uri))
                    .unwrap_or(false)
        };

        let mut partitions: BTreeMap<u32, PartitionMembers> = BTreeMap::new();
        for (uri, announced) in &uris.endpoints {
            if banned(uri) {
                continue;
            }
            for (partition_id, weight) in announced.endpoint.partitions() {
                if *partition_id >= partition_count {
                    debug!(
                        service = %service.service_name,
                        uri = %uri,
                        partition_id,
                        partition_count,
                        "announced partition outside the cluster's partitioning, ignored"
                    );
                    continue;
                }
                partitions
                    .entry(*partition_id)
                    .or_insert_with(|| {
                        PartitionMembers::empty(
                            &service.service_name,
                            &service.cluster_name,
                            *partition_id,
                            uris.generation,
                        )
                    })
                    .members
                    .push(Member {
                        endpoint: Arc::clone(&announced.endpoint),
                        weight: *weight,
                    });
            }
        }
        partitions
            .into_iter()
            .map(|(id, members)| (id, Arc::new(members)))
            .collect()
    }

    /// Recomputes the members of the services hosted by `cluster`, returns their names.
    fn rebuild_cluster_services(&mut self, cluster: &str) -> Vec<String> {
        let names: Vec<String> = self
            .services
            .iter()
            .filter(|(_, e)| e.properties.cluster_name == cluster)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            let partitions = match self.services.get(name) {
                Some(entry) => self.members_for(&entry.properties),
                None => continue,
            };
            if let Some(entry) = self.services.get_mut(name) {
                entry.partitions = partitions;
            }
        }
        names
    }

    fn resolve(&self, service: &str) -> Result<(&ServiceEntry, &ClusterEntry)> {
        let entry = self
            .services
            .get(service)
            .ok_or_else(|| BalancerError::ServiceNotFound(service.to_string()))?;
        let cluster = self
            .clusters
            .get(&entry.properties.cluster_name)
            .ok_or_else(|| BalancerError::ClusterNotFound(entry.properties.cluster_name.clone()))?;
        Ok((entry, cluster))
    }
}

type Tickers = HashMap<String, JoinHandle<()>>;

struct StateInner {
    config: StateConfig,
    registry: ArcSwap<Registry>,
    version: AtomicU64,
    lifecycle: AtomicU8,
    stale: AtomicBool,
    events: ListenerDispatcher,
    probe: Arc<dyn HealthProbe>,
    // serializes mutations; owns the per service strategy tickers
    mutation: Mutex<Tickers>,
}

impl Drop for StateInner {
    fn drop(&mut self) {
        for handle in self.mutation.get_mut().values() {
            handle.abort();
        }
    }
}

/// Versioned registry of clusters, services and announced endpoints.
///
/// Reads (`get_ring`, `get_endpoint`, ...) load the current registry and
/// partition snapshots without taking any lock. Mutations are serialized by an
/// async mutex, publish a new registry, bump the version, rebuild the affected
/// partitions through the service's strategy and notify the listeners.
#[derive(Clone)]
pub struct LoadBalancerState {
    inner: Arc<StateInner>,
}

impl fmt::Debug for LoadBalancerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancerState")
            .field("version", &self.version())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

impl LoadBalancerState {
    /// Must be called inside a tokio runtime: the listener dispatcher is spawned here.
    pub fn new(config: StateConfig) -> Result<Self> {
        Self::with_probe(config, Arc::new(NoopProbe))
    }

    pub fn with_probe(config: StateConfig, probe: Arc<dyn HealthProbe>) -> Result<Self> {
        config.validate()?;
        let events = ListenerDispatcher::start(config.listener_queue_capacity);
        Ok(LoadBalancerState {
            inner: Arc::new(StateInner {
                config,
                registry: ArcSwap::from_pointee(Registry::default()),
                version: AtomicU64::new(0),
                lifecycle: AtomicU8::new(Lifecycle::Uninitialized.as_u8()),
                stale: AtomicBool::new(false),
                events,
                probe,
                mutation: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &StateConfig {
        &self.inner.config
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.lifecycle.load(Ordering::Acquire))
    }

    pub fn is_stale(&self) -> bool {
        self.inner.stale.load(Ordering::Acquire)
    }

    pub fn subscribe(&self, listener: Arc<dyn StateListener>) {
        self.inner.events.subscribe(listener);
    }

    /// Waits until the events emitted so far reached the listeners.
    pub async fn flush_events(&self) {
        self.inner.events.flush().await;
    }

    pub fn stats(&self) -> StateStats {
        let registry = self.inner.registry.load();
        StateStats {
            version: self.version(),
            lifecycle: self.lifecycle(),
            stale: self.is_stale(),
            clusters: registry.clusters.len(),
            services: registry.services.len(),
            endpoints: registry.uris.values().map(|u| u.endpoints.len()).sum(),
            dropped_events: self.inner.events.dropped_events(),
        }
    }

    fn transition(&self, to: Lifecycle) -> Lifecycle {
        let previous = Lifecycle::from_u8(self.inner.lifecycle.swap(to.as_u8(), Ordering::AcqRel));
        if previous != to {
            info!(from = %previous, to = %to, "load balancer state lifecycle changed");
            self.inner.events.emit(StateEvent::LifecycleChanged {
                previous,
                current: to,
            });
        }
        previous
    }

    /// Uninitialized -> Initializing, when the first snapshot load starts.
    pub fn begin_initialization(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Uninitialized => {
                self.transition(Lifecycle::Initializing);
                Ok(())
            }
            Lifecycle::Initializing | Lifecycle::Steady => Ok(()),
            Lifecycle::ShuttingDown | Lifecycle::Stopped => Err(BalancerError::ShuttingDown),
        }
    }

    /// Marks the first snapshot as loaded.
    pub fn mark_steady(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Uninitialized | Lifecycle::Initializing => {
                self.transition(Lifecycle::Steady);
                Ok(())
            }
            Lifecycle::Steady => Ok(()),
            Lifecycle::ShuttingDown | Lifecycle::Stopped => Err(BalancerError::ShuttingDown),
        }
    }

    /// Flags the coordination feed as stale (or fresh again). Routing is unaffected.
    pub fn set_stale(&self, stale: bool) {
        let previous = self.inner.stale.swap(stale, Ordering::AcqRel);
        if previous == stale {
            return;
        }
        if stale {
            let err = BalancerError::StaleState("coordination feed disconnected".to_string());
            warn!(error = %err, version = self.version(), "routing continues on the last known snapshot");
        } else {
            info!(version = self.version(), "coordination feed fresh again");
        }
        self.inner.events.emit(StateEvent::StaleChanged { stale });
    }

    async fn begin_mutation(&self) -> Result<MutexGuard<'_, Tickers>> {
        let guard = self.inner.mutation.lock().await;
        if !self.lifecycle().accepts_mutations() {
            return Err(BalancerError::ShuttingDown);
        }
        Ok(guard)
    }

    fn bump_version(&self) -> u64 {
        self.inner.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Replaces a cluster's properties. Identical properties are a no-op.
    pub async fn update_cluster_properties(&self, properties: ClusterProperties) -> Result<u64> {
        let _guard = self.begin_mutation().await?;
        self.apply_cluster(properties).await
    }

    pub async fn remove_cluster(&self, cluster: &str) -> Result<u64> {
        let _guard = self.begin_mutation().await?;
        self.apply_cluster_removal(cluster).await
    }

    /// Replaces a service's properties. The strategy instance, and the health it
    /// learned, is kept unless the strategy configuration changed.
    pub async fn update_service_properties(&self, properties: ServiceProperties) -> Result<u64> {
        let mut tickers = self.begin_mutation().await?;
        self.apply_service(&mut tickers, properties).await
    }

    pub async fn remove_service(&self, service: &str) -> Result<u64> {
        let mut tickers = self.begin_mutation().await?;
        self.apply_service_removal(&mut tickers, service)
    }

    /// Adds, changes or withdraws an announced URI of a cluster. Replaying an
    /// identical announcement or withdrawing an unknown URI changes nothing.
    pub async fn update_uri_announcement(&self, cluster: &str, change: UriChange) -> Result<u64> {
        let _guard = self.begin_mutation().await?;
        self.apply_uri(cluster, change).await
    }

    /// Reconciles the registry with a full store snapshot: everything listed is
    /// applied, everything else is removed. Invalid documents are logged and
    /// skipped, leaving the previous value in place.
    pub async fn apply_snapshot(&self, snapshot: StateSnapshot) -> Result<u64> {
        let mut tickers = self.begin_mutation().await?;

        for properties in snapshot.clusters.iter().cloned() {
            let name = properties.cluster_name.clone();
            if let Err(e) = self.apply_cluster(properties).await {
                warn!(cluster = %name, error = %e, "skipping cluster from snapshot");
            }
        }
        for properties in snapshot.services.iter().cloned() {
            let name = properties.service_name.clone();
            if let Err(e) = self.apply_service(&mut tickers, properties).await {
                warn!(service = %name, error = %e, "skipping service from snapshot");
            }
        }
        for (cluster, announcements) in &snapshot.uris {
            for announcement in announcements.iter().cloned() {
                let uri = announcement.uri.clone();
                if let Err(e) = self.apply_uri(cluster, UriChange::Add(announcement)).await {
                    warn!(cluster = %cluster, uri = %uri, error = %e, "skipping announcement from snapshot");
                }
            }
        }

        let registry = self.inner.registry.load_full();
        for (cluster, set) in &registry.uris {
            let listed = snapshot.uris.get(cluster);
            for uri in set.endpoints.keys() {
                if !listed.map(|l| l.iter().any(|a| &a.uri == uri)).unwrap_or(false) {
                    self.apply_uri(cluster, UriChange::Remove(uri.clone())).await?;
                }
            }
        }
        for service in registry.services.keys() {
            if !snapshot.services.iter().any(|s| &s.service_name == service) {
                self.apply_service_removal(&mut tickers, service)?;
            }
        }
        for cluster in registry.clusters.keys() {
            if !snapshot.clusters.iter().any(|c| &c.cluster_name == cluster) {
                self.apply_cluster_removal(cluster).await?;
            }
        }
        Ok(self.version())
    }

    async fn apply_cluster(&self, properties: ClusterProperties) -> Result<u64> {
        properties.validate()?;
        let accessor = PartitionAccessor::from_properties(&properties.partitioning)?;
        let registry = self.inner.registry.load_full();
        let name = properties.cluster_name.clone();
        let previous = registry.clusters.get(&name).map(|c| Arc::clone(&c.properties));
        if previous.as_deref() == Some(&properties) {
            debug!(cluster = %name, "cluster properties unchanged");
            return Ok(self.version());
        }

        let current = Arc::new(properties);
        let mut next = (*registry).clone();
        next.clusters.insert(
            name.clone(),
            ClusterEntry {
                properties: Arc::clone(&current),
                accessor,
            },
        );
        next.uris.entry(name.clone()).or_default().generation += 1;
        let affected = next.rebuild_cluster_services(&name);
        let version = self.bump_version();
        self.inner.registry.store(Arc::new(next));

        info!(
            cluster = %name,
            partitions = accessor.partition_count(),
            version,
            "cluster properties updated"
        );
        self.inner.events.emit(StateEvent::ClusterUpdated {
            cluster: name,
            previous,
            current,
            version,
        });
        self.refresh(&affected).await;
        Ok(version)
    }

    async fn apply_cluster_removal(&self, cluster: &str) -> Result<u64> {
        let registry = self.inner.registry.load_full();
        let Some(entry) = registry.clusters.get(cluster) else {
            return Err(BalancerError::ClusterNotFound(cluster.to_string()));
        };
        let previous = Arc::clone(&entry.properties);

        let mut next = (*registry).clone();
        next.clusters.remove(cluster);
        if let Some(set) = next.uris.get_mut(cluster) {
            set.generation += 1;
        }
        let affected = next.rebuild_cluster_services(cluster);
        let version = self.bump_version();
        self.inner.registry.store(Arc::new(next));

        info!(cluster = %cluster, version, "cluster removed");
        self.inner.events.emit(StateEvent::ClusterRemoved {
            cluster: cluster.to_string(),
            previous,
            version,
        });
        self.refresh(&affected).await;
        Ok(version)
    }

    async fn apply_service(&self, tickers: &mut Tickers, properties: ServiceProperties) -> Result<u64> {
        properties.validate()?;
        let registry = self.inner.registry.load_full();
        let name = properties.service_name.clone();
        let existing = registry.services.get(&name);
        let previous = existing.map(|e| Arc::clone(&e.properties));
        if previous.as_deref() == Some(&properties) {
            debug!(service = %name, "service properties unchanged");
            return Ok(self.version());
        }

        let strategy = match existing {
            Some(e) if e.strategy.matches(&properties.strategy) => Arc::clone(&e.strategy),
            _ => Arc::new(Strategy::from_properties(
                &properties.strategy,
                self.inner.events.clone(),
                Arc::clone(&self.inner.probe),
            )),
        };
        let replaced = existing
            .map(|e| !Arc::ptr_eq(&e.strategy, &strategy))
            .unwrap_or(true);

        let current = Arc::new(properties);
        let mut next = (*registry).clone();
        let partitions = next.members_for(&current);
        next.services.insert(
            name.clone(),
            ServiceEntry {
                properties: Arc::clone(&current),
                strategy: Arc::clone(&strategy),
                partitions,
            },
        );
        let version = self.bump_version();
        self.inner.registry.store(Arc::new(next));
        if replaced {
            self.start_ticker(tickers, &name, &strategy);
        }

        info!(
            service = %name,
            cluster = %current.cluster_name,
            strategy = strategy.name(),
            new_strategy = replaced,
            version,
            "service properties updated"
        );
        self.inner.events.emit(StateEvent::ServiceUpdated {
            service: name.clone(),
            previous,
            current,
            version,
        });
        self.refresh(&[name]).await;
        Ok(version)
    }

    fn apply_service_removal(&self, tickers: &mut Tickers, service: &str) -> Result<u64> {
        let registry = self.inner.registry.load_full();
        let Some(entry) = registry.services.get(service) else {
            return Err(BalancerError::ServiceNotFound(service.to_string()));
        };
        let previous = Arc::clone(&entry.properties);

        let mut next = (*registry).clone();
        next.services.remove(service);
        let version = self.bump_version();
        self.inner.registry.store(Arc::new(next));
        if let Some(handle) = tickers.remove(service) {
            handle.abort();
        }

        info!(service = %service, version, "service removed");
        self.inner.events.emit(StateEvent::ServiceRemoved {
            service: service.to_string(),
            previous,
            version,
        });
        Ok(version)
    }

    async fn apply_uri(&self, cluster: &str, change: UriChange) -> Result<u64> {
        let registry = self.inner.registry.load_full();
        let set = registry.uris.get(cluster);
        let mut next = (*registry).clone();
        let next_set = next.uris.entry(cluster.to_string()).or_default();

        let (uri, previous, current) = match change {
            UriChange::Add(announcement) => {
                announcement.validate()?;
                let scheme = announcement.scheme()?.to_string();
                let existing = set.and_then(|s| s.endpoints.get(&announcement.uri));
                if existing.map(|a| *a.announcement == announcement).unwrap_or(false) {
                    debug!(cluster = %cluster, uri = %announcement.uri, "announcement unchanged");
                    return Ok(self.version());
                }
                // a changed announcement keeps the call history of the URI
                let tracker = existing
                    .map(|a| Arc::clone(a.endpoint.tracker()))
                    .unwrap_or_else(|| Arc::new(CallTracker::new(&self.inner.config.call_tracker)));
                let endpoint: Endpoint = Arc::new(TrackerClient::new(
                    announcement.uri.clone(),
                    scheme,
                    cluster,
                    announcement.partitions.clone(),
                    announcement.do_not_slow_start,
                    tracker,
                ));
                let uri = announcement.uri.clone();
                next_set.endpoints.insert(
                    uri.clone(),
                    Announced {
                        announcement: Arc::new(announcement),
                        endpoint: Arc::clone(&endpoint),
                    },
                );
                (uri, existing.map(|a| Arc::clone(&a.endpoint)), Some(endpoint))
            }
            UriChange::Remove(uri) => {
                let Some(existing) = set.and_then(|s| s.endpoints.get(&uri)) else {
                    debug!(cluster = %cluster, uri = %uri, "withdrawn uri was not announced");
                    return Ok(self.version());
                };
                next_set.endpoints.remove(&uri);
                (uri, Some(Arc::clone(&existing.endpoint)), None)
            }
        };
        next_set.generation += 1;
        let generation = next_set.generation;

        let affected = next.rebuild_cluster_services(cluster);
        let version = self.bump_version();
        self.inner.registry.store(Arc::new(next));

        info!(
            cluster = %cluster,
            uri = %uri,
            change = if current.is_none() { "withdrawn" } else if previous.is_some() { "updated" } else { "announced" },
            generation,
            version,
            "cluster membership changed"
        );
        self.inner.events.emit(StateEvent::MembershipChanged {
            cluster: cluster.to_string(),
            uri,
            previous,
            current,
            generation,
            version,
        });
        self.refresh(&affected).await;
        Ok(version)
    }

    /// Rebuilds every partition of the listed services from the current registry.
    async fn refresh(&self, services: &[String]) {
        let registry = self.inner.registry.load_full();
        for name in services {
            let Some(entry) = registry.services.get(name) else {
                continue;
            };
            let ids: Vec<u32> = entry.partitions.keys().copied().collect();
            entry.strategy.retain_partitions(&ids);
            for members in entry.partitions.values() {
                entry.strategy.update_partition(members).await;
            }
        }
    }

    fn start_ticker(&self, tickers: &mut Tickers, service: &str, strategy: &Arc<Strategy>) {
        if let Some(handle) = tickers.remove(service) {
            handle.abort();
        }
        let Some(period) = strategy.tick_interval() else {
            return;
        };
        let state = Arc::downgrade(&self.inner);
        let name = service.to_string();
        let strategy = Arc::clone(strategy);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let partitions = match state.upgrade() {
                    Some(inner) => inner
                        .registry
                        .load()
                        .services
                        .get(&name)
                        .filter(|e| Arc::ptr_eq(&e.strategy, &strategy))
                        .map(|e| e.partitions.values().cloned().collect::<Vec<_>>()),
                    None => None,
                };
                let Some(partitions) = partitions else {
                    break;
                };
                strategy.on_quarantine_tick(&partitions).await;
            }
            trace!(service = %name, "strategy ticker stopped");
        });
        tickers.insert(service.to_string(), handle);
    }

    /// Stops accepting mutations, stops the strategy tickers and drains the listeners.
    pub async fn shutdown(&self) {
        let mut tickers = self.inner.mutation.lock().await;
        if !self.lifecycle().accepts_mutations() {
            return;
        }
        self.transition(Lifecycle::ShuttingDown);
        for (_, handle) in tickers.drain() {
            handle.abort();
        }
        self.transition(Lifecycle::Stopped);
        self.inner.events.close().await;
    }

    fn partition_snapshot(entry: &ServiceEntry, partition_id: u32) -> Option<Arc<PartitionState>> {
        entry
            .partitions
            .get(&partition_id)
            .map(|members| entry.strategy.partition_state(members))
    }

    fn check_scheme(service: &str, schemes: &[String], requested: Option<&str>) -> Result<()> {
        match requested {
            Some(scheme) if !schemes.iter().any(|s| s == scheme) => Err(BalancerError::UnsupportedScheme {
                service: service.to_string(),
                scheme: scheme.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Ring of the requested scheme, or of the first prioritized scheme that has endpoints.
    fn select_ring(
        service: &str,
        state: &PartitionState,
        schemes: &[String],
        requested: Option<&str>,
    ) -> Result<Arc<HashRing<Endpoint>>> {
        Self::check_scheme(service, schemes, requested)?;
        if let Some(scheme) = requested {
            return Ok(state.ring(scheme).cloned().unwrap_or_default());
        }
        Ok(schemes
            .iter()
            .filter_map(|s| state.ring(s))
            .find(|ring| !ring.is_empty())
            .cloned()
            .unwrap_or_default())
    }

    /// Ring of a partition of a service, empty when the partition has no routable endpoint.
    pub fn get_ring(
        &self,
        service: &str,
        partition_id: u32,
        scheme: Option<&str>,
    ) -> Result<Arc<HashRing<Endpoint>>> {
        let registry = self.inner.registry.load();
        let (entry, cluster) = registry.resolve(service)?;
        cluster.accessor.validate_id(partition_id)?;
        let schemes = entry.properties.effective_schemes(Some(&cluster.properties));
        match Self::partition_snapshot(entry, partition_id) {
            Some(state) => Self::select_ring(service, &state, &schemes, scheme),
            None => {
                Self::check_scheme(service, &schemes, scheme)?;
                Ok(Arc::default())
            }
        }
    }

    /// Picks the endpoint of a call: partition routing, the service's drop rate,
    /// then a ring lookup by key (or at a random point for keyless routes).
    pub fn get_endpoint(&self, service: &str, route: Route<'_>, scheme: Option<&str>) -> Result<Endpoint> {
        let registry = self.inner.registry.load();
        let (entry, cluster) = registry.resolve(service)?;
        let partition_id = cluster.accessor.partition_for(route)?;
        let no_endpoint = || BalancerError::NoEndpointAvailable {
            service: service.to_string(),
            partition_id,
        };
        let schemes = entry.properties.effective_schemes(Some(&cluster.properties));
        let Some(state) = Self::partition_snapshot(entry, partition_id) else {
            return Err(no_endpoint());
        };
        let ring = Self::select_ring(service, &state, &schemes, scheme)?;

        let drop_rate = state.override_drop_rate();
        if drop_rate > 0.0 && rand::random::<f64>() < drop_rate {
            debug!(service = %service, partition_id, drop_rate, "call dropped");
            return Err(BalancerError::CallDropped {
                service: service.to_string(),
                drop_rate,
            });
        }

        let endpoint = match route {
            Route::Key(key) => ring.get(key.as_bytes()),
            Route::Any | Route::Partition(_) => ring.get_by_hash(rand::random::<u32>()),
        };
        endpoint.cloned().ok_or_else(no_endpoint)
    }

    /// Up to `n` distinct endpoints in ring order from the key, for retries on other hosts.
    pub fn get_endpoints_for_key(&self, service: &str, key: &str, n: usize) -> Result<Vec<Endpoint>> {
        let registry = self.inner.registry.load();
        let (entry, cluster) = registry.resolve(service)?;
        let partition_id = cluster.accessor.partition_for(Route::Key(key))?;
        let schemes = entry.properties.effective_schemes(Some(&cluster.properties));
        let ring = match Self::partition_snapshot(entry, partition_id) {
            Some(state) => Self::select_ring(service, &state, &schemes, None)?,
            None => Arc::default(),
        };
        if ring.is_empty() {
            return Err(BalancerError::NoEndpointAvailable {
                service: service.to_string(),
                partition_id,
            });
        }
        Ok(ring.iter_from(key.as_bytes()).take(n).cloned().collect())
    }

    /// Routes a batch of keys the way `get_endpoint` routes each of them, without
    /// the drop rate check. Keys that cannot be routed are reported, not errors.
    pub fn map_keys<I, K>(&self, service: &str, keys: I) -> Result<KeyMapping>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let registry = self.inner.registry.load();
        let (entry, cluster) = registry.resolve(service)?;
        let schemes = entry.properties.effective_schemes(Some(&cluster.properties));

        let mut rings: BTreeMap<u32, Arc<HashRing<Endpoint>>> = BTreeMap::new();
        let mut mapping = KeyMapping::default();
        for key in keys {
            let key = key.as_ref();
            let partition_id = match cluster.accessor.partition_for_key(key) {
                Ok(id) => id,
                Err(e) => {
                    trace!(service = %service, key = %key, error = %e, "key not routable");
                    mapping.unroutable.push(key.to_string());
                    continue;
                }
            };
            let ring = match rings.get(&partition_id) {
                Some(ring) => ring.clone(),
                None => {
                    let ring = match Self::partition_snapshot(entry, partition_id) {
                        Some(state) => Self::select_ring(service, &state, &schemes, None)?,
                        None => Arc::default(),
                    };
                    rings.insert(partition_id, ring.clone());
                    ring
                }
            };
            match ring.get(key.as_bytes()) {
                Some(endpoint) => mapping
                    .hosts
                    .entry(endpoint.uri().to_string())
                    .or_insert_with(|| HostKeys {
                        endpoint: endpoint.clone(),
                        partitions: BTreeMap::new(),
                    })
                    .partitions
                    .entry(partition_id)
                    .or_default()
                    .push(key.to_string()),
                None => mapping
                    .unmapped
                    .entry(partition_id)
                    .or_default()
                    .push(key.to_string()),
            }
        }
        debug!(
            service = %service,
            hosts = mapping.hosts.len(),
            mapped = mapping.mapped_count(),
            unroutable = mapping.unroutable.len(),
            "mapped key batch"
        );
        Ok(mapping)
    }

    /// Current snapshot of a partition, rescored first if a pass is due.
    pub fn get_partition_state(&self, service: &str, partition_id: u32) -> Result<Option<Arc<PartitionState>>> {
        let registry = self.inner.registry.load();
        let (entry, cluster) = registry.resolve(service)?;
        cluster.accessor.validate_id(partition_id)?;
        Ok(Self::partition_snapshot(entry, partition_id))
    }

    /// Partitions of a service that have members
    pub fn partition_ids(&self, service: &str) -> Result<Vec<u32>> {
        let registry = self.inner.registry.load();
        let entry = registry
            .services
            .get(service)
            .ok_or_else(|| BalancerError::ServiceNotFound(service.to_string()))?;
        Ok(entry.partitions.keys().copied().collect())
    }

    /// Forces a rebuild of every partition of the service.
    pub async fn rescore_service(&self, service: &str) -> Result<()> {
        let entry = self
            .inner
            .registry
            .load()
            .services
            .get(service)
            .cloned()
            .ok_or_else(|| BalancerError::ServiceNotFound(service.to_string()))?;
        for members in entry.partitions.values() {
            entry.strategy.update_partition(members).await;
        }
        Ok(())
    }

    pub fn cluster_properties(&self, cluster: &str) -> Option<Arc<ClusterProperties>> {
        self.inner
            .registry
            .load()
            .clusters
            .get(cluster)
            .map(|c| Arc::clone(&c.properties))
    }

    pub fn service_properties(&self, service: &str) -> Option<Arc<ServiceProperties>> {
        self.inner
            .registry
            .load()
            .services
            .get(service)
            .map(|s| Arc::clone(&s.properties))
    }

    /// Announced endpoints of a cluster, in URI order
    pub fn endpoints(&self, cluster: &str) -> Vec<Endpoint> {
        self.inner
            .registry
            .load()
            .uris
            .get(cluster)
            .map(|set| set.endpoints.values().map(|a| Arc::clone(&a.endpoint)).collect())
            .unwrap_or_default()
    }

    /// Membership generation of a cluster, 0 before anything was announced
    pub fn generation(&self, cluster: &str) -> u64 {
        self.inner
            .registry
            .load()
            .uris
            .get(cluster)
            .map(|set| set.generation)
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;
