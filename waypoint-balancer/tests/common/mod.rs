#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use waypoint_balancer::{
    ClusterProperties, Endpoint, ErrorType, HealthProbe, LoadBalancerState, ProbeOutcome,
    ServiceProperties, StateConfig, StrategyProperties, UriAnnouncement, UriChange,
};

pub const CLUSTER: &str = "cluster-1";
pub const SERVICE: &str = "svc";

/// State with one cluster, one service and the given announcements, in order.
pub async fn state_with(
    cluster: ClusterProperties,
    strategy: StrategyProperties,
    announcements: &[UriAnnouncement],
) -> LoadBalancerState {
    state_with_probe(cluster, strategy, announcements, None).await
}

pub async fn state_with_probe(
    cluster: ClusterProperties,
    strategy: StrategyProperties,
    announcements: &[UriAnnouncement],
    probe: Option<Arc<dyn HealthProbe>>,
) -> LoadBalancerState {
    let state = match probe {
        Some(probe) => LoadBalancerState::with_probe(StateConfig::default(), probe),
        None => LoadBalancerState::new(StateConfig::default()),
    }
    .expect("valid state config");
    let cluster_name = cluster.cluster_name.clone();
    state
        .update_cluster_properties(cluster)
        .await
        .expect("cluster accepted");
    state
        .update_service_properties(ServiceProperties::new(SERVICE, &cluster_name, strategy))
        .await
        .expect("service accepted");
    for announcement in announcements {
        state
            .update_uri_announcement(&cluster_name, UriChange::Add(announcement.clone()))
            .await
            .expect("announcement accepted");
    }
    state
}

pub fn announce_all(uris: &[&str]) -> Vec<UriAnnouncement> {
    uris.iter().map(|uri| UriAnnouncement::new(*uri)).collect()
}

pub fn endpoint_of(state: &LoadBalancerState, uri: &str) -> Endpoint {
    state
        .endpoints(CLUSTER)
        .into_iter()
        .find(|e| e.uri() == uri)
        .expect("announced endpoint")
}

/// Feeds `calls` completed calls, the first `errors` of them failed with a server error.
pub fn record_calls(endpoint: &Endpoint, calls: usize, latency_ms: u64, errors: usize) {
    for i in 0..calls {
        let outcome = if i < errors {
            Err(ErrorType::ServerError)
        } else {
            Ok(())
        };
        endpoint
            .tracker()
            .record(Duration::from_millis(latency_ms), outcome);
    }
}

/// Health probe whose verdict the test flips at will
pub struct SwitchProbe {
    healthy: AtomicBool,
}

impl SwitchProbe {
    pub fn new(healthy: bool) -> Arc<Self> {
        Arc::new(SwitchProbe {
            healthy: AtomicBool::new(healthy),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for SwitchProbe {
    async fn probe(&self, _endpoint: &Endpoint) -> ProbeOutcome {
        if self.healthy.load(Ordering::SeqCst) {
            ProbeOutcome::Healthy {
                latency: Duration::from_millis(5),
            }
        } else {
            ProbeOutcome::Unhealthy
        }
    }
}
