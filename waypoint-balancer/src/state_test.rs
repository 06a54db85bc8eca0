use super::*;
use crate::config::RelativeConfig;
use crate::partition_state::HealthStatus;
use crate::properties::{HashAlgorithm, PartitionProperties, StrategyProperties};
use std::collections::BTreeSet;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tracing_test::traced_test;

#[derive(Default)]
struct Recorder {
    events: StdMutex<Vec<StateEvent>>,
}

impl StateListener for Recorder {
    fn on_event(&self, event: &StateEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn degrader_service(name: &str, cluster: &str) -> ServiceProperties {
    ServiceProperties::new(name, cluster, StrategyProperties::default())
}

async fn single_cluster(uris: &[&str]) -> LoadBalancerState {
    let state = LoadBalancerState::new(StateConfig::default()).unwrap();
    state
        .update_cluster_properties(ClusterProperties::new("c"))
        .await
        .unwrap();
    state
        .update_service_properties(degrader_service("s", "c"))
        .await
        .unwrap();
    for uri in uris {
        state
            .update_uri_announcement("c", UriChange::Add(UriAnnouncement::new(*uri)))
            .await
            .unwrap();
    }
    state
}

fn ring_uris(ring: &HashRing<Endpoint>) -> Vec<String> {
    ring.members().iter().map(|e| e.uri().to_string()).collect()
}

#[tokio::test]
async fn versions_bump_only_on_real_changes() {
    let state = LoadBalancerState::new(StateConfig::default()).unwrap();
    assert_eq!(state.lifecycle(), Lifecycle::Uninitialized);
    assert_eq!(state.version(), 0);

    state.begin_initialization().unwrap();
    assert_eq!(state.lifecycle(), Lifecycle::Initializing);

    let cluster = ClusterProperties::new("c");
    assert_eq!(state.update_cluster_properties(cluster.clone()).await.unwrap(), 1);
    assert_eq!(state.update_cluster_properties(cluster).await.unwrap(), 1);

    let announcement = UriAnnouncement::new("http://a:1");
    let change = UriChange::Add(announcement.clone());
    assert_eq!(state.update_uri_announcement("c", change.clone()).await.unwrap(), 2);
    assert_eq!(state.update_uri_announcement("c", change).await.unwrap(), 2);
    let generation = state.generation("c");

    let withdrawn = UriChange::Remove("http://unknown:1".to_string());
    assert_eq!(state.update_uri_announcement("c", withdrawn).await.unwrap(), 2);
    assert_eq!(state.generation("c"), generation);

    state.mark_steady().unwrap();
    assert_eq!(state.lifecycle(), Lifecycle::Steady);
}

#[tokio::test]
async fn invalid_properties_leave_the_previous_value() {
    let state = single_cluster(&["http://a:1"]).await;
    let version = state.version();

    let mut broken = ClusterProperties::new("c");
    broken.partitioning = PartitionProperties::Hash {
        partition_count: 0,
        hash_algorithm: Default::default(),
    };
    let err = state.update_cluster_properties(broken).await.unwrap_err();
    assert!(matches!(err, BalancerError::Configuration(_)));

    let err = state
        .update_uri_announcement("c", UriChange::Add(UriAnnouncement::new("no-scheme")))
        .await
        .unwrap_err();
    assert!(matches!(err, BalancerError::Configuration(_)));

    assert_eq!(state.version(), version);
    assert_eq!(state.get_ring("s", 0, None).unwrap().len(), 1);
}

#[tokio::test]
async fn banned_uris_never_enter_the_ring() {
    let state = single_cluster(&["http://a:1", "http://b:1", "http://c:1"]).await;

    let mut cluster = ClusterProperties::new("c");
    cluster.banned_uris = BTreeSet::from(["http://a:1".to_string()]);
    state.update_cluster_properties(cluster).await.unwrap();

    let mut service = degrader_service("s", "c");
    service.banned_uris = BTreeSet::from(["http://b:1".to_string()]);
    state.update_service_properties(service).await.unwrap();

    let ring = state.get_ring("s", 0, None).unwrap();
    assert_eq!(ring_uris(&ring), vec!["http://c:1".to_string()]);
    // bans filter rings, not the announced membership
    assert_eq!(state.endpoints("c").len(), 3);
}

#[tokio::test]
async fn rings_follow_scheme_priority() {
    let state = single_cluster(&["https://secure:1", "http://plain:1"]).await;

    let ring = state.get_ring("s", 0, None).unwrap();
    assert_eq!(ring_uris(&ring), vec!["https://secure:1".to_string()]);

    let ring = state.get_ring("s", 0, Some("http")).unwrap();
    assert_eq!(ring_uris(&ring), vec!["http://plain:1".to_string()]);

    let err = state.get_ring("s", 0, Some("grpc")).unwrap_err();
    assert!(matches!(err, BalancerError::UnsupportedScheme { .. }));

    let mut service = degrader_service("s", "c");
    service.prioritized_schemes = vec!["http".to_string()];
    state.update_service_properties(service).await.unwrap();
    let endpoint = state.get_endpoint("s", Route::Any, None).unwrap();
    assert_eq!(endpoint.uri(), "http://plain:1");
}

#[tokio::test]
async fn empty_scheme_falls_through_to_the_next() {
    let state = single_cluster(&["http://plain:1"]).await;
    let endpoint = state.get_endpoint("s", Route::Any, None).unwrap();
    assert_eq!(endpoint.uri(), "http://plain:1");
}

#[tokio::test]
async fn routing_errors() {
    let state = LoadBalancerState::new(StateConfig::default()).unwrap();
    let err = state.get_endpoint("nope", Route::Any, None).unwrap_err();
    assert!(matches!(err, BalancerError::ServiceNotFound(_)));

    state
        .update_service_properties(degrader_service("orphan", "missing"))
        .await
        .unwrap();
    let err = state.get_ring("orphan", 0, None).unwrap_err();
    assert!(matches!(err, BalancerError::ClusterNotFound(_)));

    let mut cluster = ClusterProperties::new("p");
    cluster.partitioning = PartitionProperties::Hash {
        partition_count: 4,
        hash_algorithm: Default::default(),
    };
    state.update_cluster_properties(cluster).await.unwrap();
    state
        .update_service_properties(degrader_service("partitioned", "p"))
        .await
        .unwrap();

    let err = state.get_endpoint("partitioned", Route::Any, None).unwrap_err();
    assert!(matches!(err, BalancerError::PartitionRouting(_)));
    let err = state.get_ring("partitioned", 7, None).unwrap_err();
    assert!(matches!(err, BalancerError::PartitionRouting(_)));

    // a valid partition without members is an empty ring, not an error
    assert!(state.get_ring("partitioned", 3, None).unwrap().is_empty());
    let err = state
        .get_endpoint("partitioned", Route::Partition(3), None)
        .unwrap_err();
    assert!(err.is_routing_outcome());
}

#[tokio::test]
async fn zero_weight_keeps_an_endpoint_on_standby() {
    let state = single_cluster(&[]).await;
    state
        .update_uri_announcement(
            "c",
            UriChange::Add(UriAnnouncement::new("http://spare:1").with_weight(0, 0.0)),
        )
        .await
        .unwrap();

    let err = state.get_endpoint("s", Route::Any, None).unwrap_err();
    assert!(matches!(err, BalancerError::NoEndpointAvailable { .. }));

    let partition = state.get_partition_state("s", 0).unwrap().unwrap();
    let health = partition.endpoint_health("http://spare:1").unwrap();
    assert_eq!(health.status, HealthStatus::Standby);
    assert_eq!(health.points, 0);
}

#[tokio::test]
async fn keyed_lookups_are_stable_and_spread_for_retries() {
    let state = single_cluster(&["http://a:1", "http://b:1", "http://c:1", "http://d:1"]).await;

    let first = state.get_endpoint("s", Route::Key("user-42"), None).unwrap();
    for _ in 0..20 {
        let again = state.get_endpoint("s", Route::Key("user-42"), None).unwrap();
        assert_eq!(again.uri(), first.uri());
    }

    let candidates = state.get_endpoints_for_key("s", "user-42", 3).unwrap();
    assert_eq!(candidates.len(), 3);
    assert_eq!(candidates[0].uri(), first.uri());
    let distinct: BTreeSet<&str> = candidates.iter().map(|e| e.uri()).collect();
    assert_eq!(distinct.len(), 3);

    let all = state.get_endpoints_for_key("s", "user-42", 10).unwrap();
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn withdrawal_shrinks_the_ring_and_notifies() {
    let state = single_cluster(&["http://a:1", "http://b:1"]).await;
    let recorder = Arc::new(Recorder::default());
    state.subscribe(recorder.clone());

    state
        .update_uri_announcement("c", UriChange::Remove("http://a:1".to_string()))
        .await
        .unwrap();
    let ring = state.get_ring("s", 0, None).unwrap();
    assert_eq!(ring_uris(&ring), vec!["http://b:1".to_string()]);

    state.flush_events().await;
    let events = recorder.events.lock().unwrap();
    let membership = events
        .iter()
        .find_map(|e| match e {
            StateEvent::MembershipChanged {
                uri,
                previous,
                current,
                ..
            } => Some((uri.clone(), previous.is_some(), current.is_none())),
            _ => None,
        })
        .unwrap();
    assert_eq!(membership, ("http://a:1".to_string(), true, true));
    assert!(events
        .iter()
        .any(|e| matches!(e, StateEvent::RingRebuilt { endpoint_count: 1, .. })));
}

#[tokio::test]
async fn reannouncement_keeps_the_call_history() {
    let state = single_cluster(&["http://a:1"]).await;
    let before = Arc::clone(&state.endpoints("c")[0]);
    before.tracker().record(Duration::from_millis(5), Ok(()));

    state
        .update_uri_announcement(
            "c",
            UriChange::Add(UriAnnouncement::new("http://a:1").with_weight(0, 2.0)),
        )
        .await
        .unwrap();

    let after = Arc::clone(&state.endpoints("c")[0]);
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(Arc::ptr_eq(before.tracker(), after.tracker()));
    assert_eq!(after.weight(0), Some(2.0));
    assert_eq!(after.tracker().total_calls(), 1);
}

#[tokio::test]
async fn strategy_survives_unrelated_service_changes() {
    let state = single_cluster(&["http://a:1"]).await;
    let strategy_of = |state: &LoadBalancerState| {
        Arc::clone(&state.inner.registry.load().services["s"].strategy)
    };
    let original = strategy_of(&state);

    let mut service = degrader_service("s", "c");
    service.path = "/v2".to_string();
    state.update_service_properties(service.clone()).await.unwrap();
    assert!(Arc::ptr_eq(&original, &strategy_of(&state)));

    service.strategy = StrategyProperties::Relative(RelativeConfig::default());
    state.update_service_properties(service).await.unwrap();
    let replaced = strategy_of(&state);
    assert!(!Arc::ptr_eq(&original, &replaced));
    assert_eq!(replaced.name(), "relative");
    assert_eq!(state.get_ring("s", 0, None).unwrap().len(), 1);
}

#[tokio::test]
async fn only_ticking_strategies_get_a_ticker() {
    let state = single_cluster(&["http://a:1"]).await;
    assert!(!state.inner.mutation.lock().await.contains_key("s"));

    let relative = ServiceProperties::new(
        "s",
        "c",
        StrategyProperties::Relative(RelativeConfig::default()),
    );
    state.update_service_properties(relative).await.unwrap();
    assert!(state.inner.mutation.lock().await.contains_key("s"));

    state.remove_service("s").await.unwrap();
    assert!(!state.inner.mutation.lock().await.contains_key("s"));
    let err = state.get_ring("s", 0, None).unwrap_err();
    assert!(matches!(err, BalancerError::ServiceNotFound(_)));
}

#[tokio::test]
async fn removed_cluster_keeps_its_announcements() {
    let state = single_cluster(&["http://a:1"]).await;

    state.remove_cluster("c").await.unwrap();
    let err = state.get_endpoint("s", Route::Any, None).unwrap_err();
    assert!(matches!(err, BalancerError::ClusterNotFound(_)));
    assert_eq!(state.stats().endpoints, 1);

    let err = state.remove_cluster("c").await.unwrap_err();
    assert!(matches!(err, BalancerError::ClusterNotFound(_)));

    state
        .update_cluster_properties(ClusterProperties::new("c"))
        .await
        .unwrap();
    let endpoint = state.get_endpoint("s", Route::Any, None).unwrap();
    assert_eq!(endpoint.uri(), "http://a:1");
}

#[tokio::test]
async fn snapshot_reconciles_the_registry() {
    let state = LoadBalancerState::new(StateConfig::default()).unwrap();
    let full = StateSnapshot {
        clusters: vec![ClusterProperties::new("c1"), ClusterProperties::new("c2")],
        services: vec![degrader_service("s1", "c1"), degrader_service("s2", "c2")],
        uris: BTreeMap::from([
            (
                "c1".to_string(),
                vec![
                    UriAnnouncement::new("http://a:1"),
                    UriAnnouncement::new("http://b:1"),
                ],
            ),
            ("c2".to_string(), vec![UriAnnouncement::new("http://x:1")]),
        ]),
    };
    state.apply_snapshot(full).await.unwrap();
    let stats = state.stats();
    assert_eq!((stats.clusters, stats.services, stats.endpoints), (2, 2, 3));

    let mut broken = degrader_service("bad", "c1");
    broken.prioritized_schemes = vec![String::new()];
    let trimmed = StateSnapshot {
        clusters: vec![ClusterProperties::new("c1")],
        services: vec![degrader_service("s1", "c1"), broken],
        uris: BTreeMap::from([("c1".to_string(), vec![UriAnnouncement::new("http://b:1")])]),
    };
    let version = state.apply_snapshot(trimmed.clone()).await.unwrap();
    let stats = state.stats();
    assert_eq!((stats.clusters, stats.services, stats.endpoints), (1, 1, 1));
    assert_eq!(
        ring_uris(&state.get_ring("s1", 0, None).unwrap()),
        vec!["http://b:1".to_string()]
    );

    // replaying the same listing is a no-op
    assert_eq!(state.apply_snapshot(trimmed).await.unwrap(), version);
}

#[tokio::test]
#[traced_test]
async fn stale_state_keeps_routing() {
    let state = single_cluster(&["http://a:1"]).await;
    state.set_stale(true);
    state.set_stale(true);
    assert!(state.is_stale());
    assert!(logs_contain("routing continues on the last known snapshot"));
    assert!(state.stats().stale);
    assert!(state.get_endpoint("s", Route::Any, None).is_ok());

    state.set_stale(false);
    assert!(!state.is_stale());
}

#[tokio::test]
async fn shutdown_refuses_mutations_but_serves_reads() {
    let state = single_cluster(&["http://a:1"]).await;
    let recorder = Arc::new(Recorder::default());
    state.subscribe(recorder.clone());

    state.shutdown().await;
    assert_eq!(state.lifecycle(), Lifecycle::Stopped);

    let err = state
        .update_cluster_properties(ClusterProperties::new("other"))
        .await
        .unwrap_err();
    assert!(matches!(err, BalancerError::ShuttingDown));
    assert!(state.begin_initialization().is_err());
    assert!(state.get_endpoint("s", Route::Any, None).is_ok());

    // idempotent
    state.shutdown().await;

    let events = recorder.events.lock().unwrap();
    let transitions: Vec<Lifecycle> = events
        .iter()
        .filter_map(|e| match e {
            StateEvent::LifecycleChanged { current, .. } => Some(*current),
            _ => None,
        })
        .collect();
    assert_eq!(transitions, vec![Lifecycle::ShuttingDown, Lifecycle::Stopped]);
}

#[tokio::test]
async fn key_batches_split_by_host_and_partition() {
    let state = LoadBalancerState::new(StateConfig::default()).unwrap();
    let mut cluster = ClusterProperties::new("p");
    cluster.partitioning = PartitionProperties::Hash {
        partition_count: 4,
        hash_algorithm: HashAlgorithm::Modulo,
    };
    state.update_cluster_properties(cluster).await.unwrap();
    state
        .update_service_properties(degrader_service("sharded", "p"))
        .await
        .unwrap();
    // partition 3 stays without a host
    for id in 0..3u32 {
        let announcement = UriAnnouncement::new(format!("http://shard-{}:1", id))
            .with_partitions(BTreeMap::from([(id, 1.0)]));
        state
            .update_uri_announcement("p", UriChange::Add(announcement))
            .await
            .unwrap();
    }

    let mut keys: Vec<String> = (0..100).map(|i| i.to_string()).collect();
    keys.push("not-a-number".to_string());
    let mapping = state.map_keys("sharded", &keys).unwrap();

    assert_eq!(mapping.hosts.len(), 3);
    assert_eq!(mapping.mapped_count(), 75);
    for id in 0..3u32 {
        let host = &mapping.hosts[&format!("http://shard-{}:1", id)];
        assert_eq!(host.partitions.keys().copied().collect::<Vec<_>>(), vec![id]);
        assert_eq!(host.key_count(), 25);
        for key in &host.partitions[&id] {
            let single = state.get_endpoint("sharded", Route::Key(key), None).unwrap();
            assert_eq!(single.uri(), host.endpoint.uri());
        }
    }
    assert_eq!(mapping.unmapped.len(), 1);
    assert_eq!(mapping.unmapped[&3].len(), 25);
    assert_eq!(mapping.unroutable, vec!["not-a-number".to_string()]);

    let err = state.map_keys("missing", ["1"]).unwrap_err();
    assert!(matches!(err, BalancerError::ServiceNotFound(_)));
}

#[tokio::test]
async fn oversized_weight_never_reaches_the_ring() {
    let state = single_cluster(&["http://a:1"]).await;
    let err = state
        .update_uri_announcement(
            "c",
            UriChange::Add(UriAnnouncement::new("http://huge:1").with_weight(0, 1e9)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BalancerError::Configuration(_)));
    assert_eq!(ring_uris(&state.get_ring("s", 0, None).unwrap()), vec!["http://a:1"]);

    let mut service = degrader_service("s", "c");
    if let StrategyProperties::Degrader(config) = &mut service.strategy {
        config.points_per_weight = crate::config::MAX_POINTS_PER_WEIGHT + 1;
    }
    let err = state.update_service_properties(service).await.unwrap_err();
    assert!(matches!(err, BalancerError::Configuration(_)));
}
