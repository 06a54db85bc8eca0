#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use waypoint_balancer::{
    ClusterProperties, LoadBalancerState, ServiceProperties, StateConfig, StateExecutor,
    StrategyProperties, UriAnnouncement,
};
use waypoint_discovery::{DiscoveryConfig, StoreKey};
use waypoint_metadata_store::{
    KeyValueVersion, MemoryStore, MetadataError, MetadataStore, WatchStream,
};

pub const CLUSTER: &str = "cluster-1";
pub const SERVICE: &str = "svc";

/// Short timings so feed loss tests finish in a few simulated seconds.
pub fn fast_config() -> DiscoveryConfig {
    DiscoveryConfig {
        reconnect_backoff_initial_ms: 100,
        reconnect_backoff_max_ms: 400,
        stale_check_interval_ms: 100,
        stale_threshold_ms: 500,
        announce_ttl_ms: 1000,
        keep_alive_interval_ms: 300,
    }
}

pub fn executor() -> StateExecutor {
    let state = LoadBalancerState::new(StateConfig::default()).expect("valid state config");
    StateExecutor::start(state).0
}

pub async fn put_cluster(store: &dyn MetadataStore, properties: &ClusterProperties) {
    let path = StoreKey::Cluster(properties.cluster_name.clone()).path();
    let value = serde_json::to_value(properties).expect("cluster serializes");
    store.put(&path, value).await.expect("put cluster");
}

pub async fn put_service(store: &dyn MetadataStore, properties: &ServiceProperties) {
    let path = StoreKey::Service(properties.service_name.clone()).path();
    let value = serde_json::to_value(properties).expect("service serializes");
    store.put(&path, value).await.expect("put service");
}

pub async fn put_uri(store: &dyn MetadataStore, node: &str, announcement: &UriAnnouncement) {
    let path = uri_path(node);
    let value = serde_json::to_value(announcement).expect("announcement serializes");
    store.put(&path, value).await.expect("put uri");
}

pub fn uri_path(node: &str) -> String {
    StoreKey::Uri {
        cluster: CLUSTER.to_string(),
        node: node.to_string(),
    }
    .path()
}

/// Cluster, service and one announcement per node, `node-i` announcing `http://host-i:8080`.
pub async fn seed(store: &dyn MetadataStore, nodes: usize) {
    put_cluster(store, &ClusterProperties::new(CLUSTER)).await;
    put_service(
        store,
        &ServiceProperties::new(SERVICE, CLUSTER, StrategyProperties::default()),
    )
    .await;
    for i in 0..nodes {
        put_uri(store, &format!("node-{i}"), &UriAnnouncement::new(host(i))).await;
    }
}

pub fn host(i: usize) -> String {
    format!("http://host-{i}:8080")
}

/// URIs currently in the service's ring, sorted.
pub fn ring_uris(state: &LoadBalancerState) -> Vec<String> {
    let Ok(ring) = state.get_ring(SERVICE, 0, None) else {
        return Vec::new();
    };
    let mut uris: Vec<String> = ring.members().iter().map(|e| e.uri().to_string()).collect();
    uris.sort();
    uris
}

/// Polls `check` every 10ms of simulated time until it holds, for at most `limit`.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    while waited <= limit {
        if check().await {
            return true;
        }
        sleep(step).await;
        waited += step;
    }
    false
}

/// MemoryStore whose watch and listing calls fail while it is "down".
#[derive(Debug, Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    down: Arc<AtomicBool>,
}

impl FlakyStore {
    /// Ends every open watch and refuses new ones until `restore`.
    pub fn cut(&self) {
        self.down.store(true, Ordering::SeqCst);
        self.inner.disconnect_watchers();
    }

    pub fn restore(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> waypoint_metadata_store::Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(MetadataError::Unavailable("store unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn get(&self, key: &str) -> waypoint_metadata_store::Result<Option<Value>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Value) -> waypoint_metadata_store::Result<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> waypoint_metadata_store::Result<()> {
        self.inner.delete(key).await
    }

    async fn watch(&self, prefix: &str) -> waypoint_metadata_store::Result<WatchStream> {
        self.check()?;
        self.inner.watch(prefix).await
    }

    async fn put_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> waypoint_metadata_store::Result<()> {
        self.inner.put_with_ttl(key, value, ttl).await
    }

    async fn keep_alive(&self, key: &str, ttl: Duration) -> waypoint_metadata_store::Result<()> {
        self.inner.keep_alive(key, ttl).await
    }

    async fn get_bulk(&self, prefix: &str) -> waypoint_metadata_store::Result<Vec<KeyValueVersion>> {
        self.check()?;
        self.inner.get_bulk(prefix).await
    }
}

pub fn shared<S: MetadataStore>(store: &S) -> Arc<dyn MetadataStore>
where
    S: Clone,
{
    Arc::new(store.clone())
}
