//! # Discovery Bridge
//!
//! Keeps a [`LoadBalancerState`](waypoint_balancer::LoadBalancerState) in line with the
//! coordination store. The bridge owns the watch feed over the three document families
//! (`/waypoint/clusters`, `/waypoint/services`, `/waypoint/uris`) and turns every store
//! change into a command for the [`StateExecutor`].
//!
//! ## Ordering
//! Every applied key remembers the `mod_revision` it was applied at, deletes included.
//! Events at or below that revision are replays or arrived out of order and are dropped,
//! so the state always holds the last write of each key.
//!
//! ## Feed loss
//! A lagging watcher resyncs from a fresh listing. A closed feed is re-opened with a
//! doubling backoff and resynced once it is back; meanwhile the watchdog flags the state
//! stale when the outage outlasts the configured threshold.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};
use waypoint_balancer::{
    BalancerError, ClusterProperties, ServiceProperties, StateExecutor, StateSnapshot,
    UriAnnouncement, UriChange,
};
use waypoint_metadata_store::{KeyValueVersion, MetadataStore, WatchEvent, WatchStream};

use crate::config::DiscoveryConfig;
use crate::errors::{DiscoveryError, Result};
use crate::paths::{StoreKey, BASE_CLUSTERS_PATH, BASE_SERVICES_PATH, BASE_URIS_PATH};
use crate::watchdog::{run_watchdog, FeedStatus};

const WATCHED_PREFIXES: [&str; 3] = [BASE_CLUSTERS_PATH, BASE_SERVICES_PATH, BASE_URIS_PATH];

/// A decoded store document.
#[derive(Debug)]
enum Document {
    Cluster(ClusterProperties),
    Service(ServiceProperties),
    Uri {
        cluster: String,
        node: String,
        announcement: UriAnnouncement,
    },
}

fn decode<T: DeserializeOwned>(key: &str, value: &[u8]) -> Result<T> {
    serde_json::from_slice(value).map_err(|e| DiscoveryError::MalformedDocument {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode_document(key: &str, value: &[u8]) -> Result<Document> {
    match StoreKey::parse(key)? {
        StoreKey::Cluster(name) => {
            let properties: ClusterProperties = decode(key, value)?;
            if properties.cluster_name != name {
                return Err(DiscoveryError::MalformedDocument {
                    key: key.to_string(),
                    reason: format!("document names cluster {}", properties.cluster_name),
                });
            }
            Ok(Document::Cluster(properties))
        }
        StoreKey::Service(name) => {
            let properties: ServiceProperties = decode(key, value)?;
            if properties.service_name != name {
                return Err(DiscoveryError::MalformedDocument {
                    key: key.to_string(),
                    reason: format!("document names service {}", properties.service_name),
                });
            }
            Ok(Document::Service(properties))
        }
        StoreKey::Uri { cluster, node } => Ok(Document::Uri {
            cluster,
            node,
            announcement: decode(key, value)?,
        }),
    }
}

/// The executor refusing commands ends the bridge; anything else is logged and the
/// previous value stays in place.
fn outcome(key: &str, result: waypoint_balancer::Result<u64>) -> Result<()> {
    match result {
        Ok(version) => {
            debug!(key = %key, version, "store change applied");
            Ok(())
        }
        Err(BalancerError::ShuttingDown) => Err(DiscoveryError::ExecutorClosed),
        Err(BalancerError::ClusterNotFound(_)) | Err(BalancerError::ServiceNotFound(_)) => {
            debug!(key = %key, "removal of an unknown entry ignored");
            Ok(())
        }
        Err(e) => {
            warn!(key = %key, error = %e, "store change rejected, keeping the previous value");
            Ok(())
        }
    }
}

/// Full listing of the three document families.
#[derive(Debug, Default)]
struct StoreListing {
    snapshot: StateSnapshot,
    revisions: HashMap<String, i64>,
    nodes: HashMap<(String, String), String>,
}

/// Mirrors the coordination store into the load balancer state.
pub struct DiscoveryService {
    store: Arc<dyn MetadataStore>,
    executor: StateExecutor,
    config: DiscoveryConfig,
    feed: Arc<FeedStatus>,
    // last applied mod_revision per key, deletes included
    applied: HashMap<String, i64>,
    // (cluster, node) -> announced uri, needed to withdraw on delete
    nodes: HashMap<(String, String), String>,
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("config", &self.config)
            .field("feed", &self.feed)
            .field("applied_keys", &self.applied.len())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl DiscoveryService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        executor: StateExecutor,
        config: DiscoveryConfig,
    ) -> Self {
        DiscoveryService {
            store,
            executor,
            config,
            feed: Arc::new(FeedStatus::default()),
            applied: HashMap::new(),
            nodes: HashMap::new(),
        }
    }

    pub fn feed(&self) -> Arc<FeedStatus> {
        Arc::clone(&self.feed)
    }

    /// Bootstraps, then runs the bridge and the stale feed watchdog in the background.
    pub async fn start(
        store: Arc<dyn MetadataStore>,
        executor: StateExecutor,
        config: DiscoveryConfig,
    ) -> Result<DiscoveryHandle> {
        config.validate()?;
        let mut service = DiscoveryService::new(store, executor.clone(), config.clone());
        let stream = service.bootstrap().await?;
        let feed = service.feed();

        let watchdog = tokio::spawn(run_watchdog(
            Arc::clone(&feed),
            executor,
            config.stale_check_interval(),
            config.stale_threshold(),
        ));
        let bridge = tokio::spawn(service.run(stream));

        Ok(DiscoveryHandle {
            bridge,
            watchdog,
            feed,
        })
    }

    /// Loads the store listing into the state and returns the live feed.
    ///
    /// The watches are opened before the listing is read, so no change can fall between
    /// the two; replays of listed writes are dropped by their revision.
    pub async fn bootstrap(&mut self) -> Result<WatchStream> {
        let state = self.executor.state().clone();
        state.begin_initialization()?;

        let stream = self.open_watches().await?;
        self.resync().await?;
        state.mark_steady()?;

        let stats = state.stats();
        info!(
            version = stats.version,
            clusters = stats.clusters,
            services = stats.services,
            endpoints = stats.endpoints,
            "discovery bootstrap completed"
        );
        Ok(stream)
    }

    async fn open_watches(&self) -> Result<WatchStream> {
        let mut streams = Vec::with_capacity(WATCHED_PREFIXES.len());
        for prefix in WATCHED_PREFIXES {
            streams.push(self.store.watch(&format!("{}/", prefix)).await?);
        }
        Ok(WatchStream::new(futures::stream::select_all(streams)))
    }

    async fn list(&self) -> Result<StoreListing> {
        let mut listing = StoreListing::default();
        let state = self.executor.state();

        for prefix in WATCHED_PREFIXES {
            let entries: Vec<KeyValueVersion> = self.store.get_bulk(prefix).await?;
            for entry in entries {
                listing.revisions.insert(entry.key.clone(), entry.mod_revision);
                match decode_document(&entry.key, &entry.value) {
                    Ok(Document::Cluster(properties)) => listing.snapshot.clusters.push(properties),
                    Ok(Document::Service(properties)) => listing.snapshot.services.push(properties),
                    Ok(Document::Uri {
                        cluster,
                        node,
                        announcement,
                    }) => {
                        listing
                            .nodes
                            .insert((cluster.clone(), node), announcement.uri.clone());
                        listing
                            .snapshot
                            .uris
                            .entry(cluster)
                            .or_default()
                            .push(announcement);
                    }
                    Err(e) => {
                        warn!(key = %entry.key, error = %e, "skipping malformed document from store listing");
                        // a listing without the entry would remove it, keep what the state holds
                        match StoreKey::parse(&entry.key) {
                            Ok(StoreKey::Cluster(name)) => {
                                if let Some(current) = state.cluster_properties(&name) {
                                    listing.snapshot.clusters.push((*current).clone());
                                }
                            }
                            Ok(StoreKey::Service(name)) => {
                                if let Some(current) = state.service_properties(&name) {
                                    listing.snapshot.services.push((*current).clone());
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        Ok(listing)
    }

    /// Reconciles the state with a fresh listing of the store.
    pub async fn resync(&mut self) -> Result<()> {
        let listing = self.list().await?;
        let listed_keys = listing.revisions.len();
        let version = self
            .executor
            .apply_snapshot(listing.snapshot)
            .await
            .map_err(|e| match e {
                BalancerError::ShuttingDown => DiscoveryError::ExecutorClosed,
                other => DiscoveryError::Balancer(other),
            })?;

        // tombstones older than the newest listed write are covered by the listing
        let horizon = listing.revisions.values().copied().max().unwrap_or(0);
        let tracked = self.applied.len();
        self.applied
            .retain(|key, revision| listing.revisions.contains_key(key) || *revision > horizon);
        let pruned = tracked - self.applied.len();

        for (key, revision) in listing.revisions {
            let applied = self.applied.entry(key).or_insert(revision);
            *applied = (*applied).max(revision);
        }
        self.nodes = listing.nodes;
        info!(version, keys = listed_keys, pruned, "state resynced from the store listing");
        Ok(())
    }

    /// Consumes the watch feed until the state stops accepting mutations.
    pub async fn run(mut self, mut stream: WatchStream) -> Result<()> {
        self.feed.connected();
        loop {
            match stream.next().await {
                Some(Ok(event)) => match self.handle_event(event).await {
                    Ok(()) => {}
                    Err(DiscoveryError::ExecutorClosed) => break,
                    Err(e) => warn!(error = %e, "skipping store event"),
                },
                Some(Err(e)) if e.is_lagged() => {
                    warn!(error = %e, "watch feed lagged, resyncing from the store");
                    match self.resync().await {
                        Ok(()) => {}
                        Err(DiscoveryError::ExecutorClosed) => break,
                        Err(e) => warn!(error = %e, "resync after lag failed"),
                    }
                }
                Some(Err(e)) => warn!(error = %e, "watch feed error"),
                None => {
                    warn!("watch feed closed, reconnecting");
                    self.feed.disconnected(Instant::now());
                    match self.reconnect().await {
                        Ok(next) => stream = next,
                        Err(DiscoveryError::ExecutorClosed) => break,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        info!("discovery bridge stopped");
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<WatchStream> {
        let max = self.config.reconnect_backoff_max();
        let mut backoff = self.config.reconnect_backoff_initial();
        let mut attempt: u32 = 0;
        loop {
            if !self.executor.state().lifecycle().accepts_mutations() {
                return Err(DiscoveryError::ExecutorClosed);
            }
            sleep(backoff).await;
            attempt += 1;

            match self.open_watches().await {
                Ok(stream) => match self.resync().await {
                    Ok(()) => {
                        self.feed.connected();
                        self.executor
                            .set_stale(false)
                            .await
                            .map_err(|_| DiscoveryError::ExecutorClosed)?;
                        info!(attempt, "watch feed re-established");
                        return Ok(stream);
                    }
                    Err(DiscoveryError::ExecutorClosed) => {
                        return Err(DiscoveryError::ExecutorClosed)
                    }
                    Err(e) => warn!(attempt, error = %e, "resync after reconnect failed"),
                },
                Err(e) => warn!(
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "failed to re-open the watch feed"
                ),
            }
            backoff = (backoff * 2).min(max);
        }
    }

    /// Applies one store change, unless a newer write of the same key was applied already.
    pub async fn handle_event(&mut self, event: WatchEvent) -> Result<()> {
        let key = match std::str::from_utf8(event.key()) {
            Ok(key) => key.to_string(),
            Err(_) => {
                let lossy = String::from_utf8_lossy(event.key()).into_owned();
                return Err(DiscoveryError::MalformedKey(lossy));
            }
        };

        if let Some(revision) = event.mod_revision() {
            if let Some(&last) = self.applied.get(&key) {
                if revision <= last {
                    trace!(key = %key, revision, last, "dropping replayed or out of order event");
                    return Ok(());
                }
            }
        }
        let store_key = StoreKey::parse(&key)?;

        let result = match event {
            WatchEvent::Put { ref value, .. } => self.apply_put(&key, value).await,
            WatchEvent::Delete { .. } => self.apply_delete(&key, store_key).await,
        };
        // a malformed document still consumes its revision
        if let Some(revision) = event.mod_revision() {
            self.applied.insert(key, revision);
        }
        result
    }

    async fn apply_put(&mut self, key: &str, value: &[u8]) -> Result<()> {
        match decode_document(key, value)? {
            Document::Cluster(properties) => {
                outcome(key, self.executor.update_cluster(properties).await)
            }
            Document::Service(properties) => {
                outcome(key, self.executor.update_service(properties).await)
            }
            Document::Uri {
                cluster,
                node,
                announcement,
            } => {
                let node_key = (cluster.clone(), node);
                let uri = announcement.uri.clone();
                if let Some(previous) = self.nodes.get(&node_key).cloned() {
                    if previous != uri && !self.uri_announced_elsewhere(&node_key, &previous) {
                        debug!(key = %key, previous = %previous, uri = %uri, "node changed its uri");
                        outcome(
                            key,
                            self.executor
                                .update_uri(cluster.clone(), UriChange::Remove(previous))
                                .await,
                        )?;
                    }
                }
                self.nodes.insert(node_key, uri);
                outcome(
                    key,
                    self.executor
                        .update_uri(cluster, UriChange::Add(announcement))
                        .await,
                )
            }
        }
    }

    async fn apply_delete(&mut self, key: &str, store_key: StoreKey) -> Result<()> {
        match store_key {
            StoreKey::Cluster(name) => outcome(key, self.executor.remove_cluster(name).await),
            StoreKey::Service(name) => outcome(key, self.executor.remove_service(name).await),
            StoreKey::Uri { cluster, node } => {
                let node_key = (cluster.clone(), node);
                let Some(uri) = self.nodes.remove(&node_key) else {
                    debug!(key = %key, "withdrawal of an unknown node ignored");
                    return Ok(());
                };
                if self.uri_announced_elsewhere(&node_key, &uri) {
                    debug!(key = %key, uri = %uri, "uri still announced by another node");
                    return Ok(());
                }
                outcome(
                    key,
                    self.executor
                        .update_uri(cluster, UriChange::Remove(uri))
                        .await,
                )
            }
        }
    }

    fn uri_announced_elsewhere(&self, node_key: &(String, String), uri: &str) -> bool {
        self.nodes
            .iter()
            .any(|((cluster, node), other)| {
                cluster == &node_key.0 && node != &node_key.1 && other == uri
            })
    }
}

/// Background tasks of a started [`DiscoveryService`]. Dropping the handle stops them.
#[derive(Debug)]
pub struct DiscoveryHandle {
    bridge: JoinHandle<Result<()>>,
    watchdog: JoinHandle<()>,
    feed: Arc<FeedStatus>,
}

impl DiscoveryHandle {
    pub fn is_connected(&self) -> bool {
        self.feed.is_connected()
    }

    pub fn is_running(&self) -> bool {
        !self.bridge.is_finished()
    }

    pub fn stop(&self) {
        self.bridge.abort();
        self.watchdog.abort();
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "bridge_test.rs"]
mod bridge_test;
