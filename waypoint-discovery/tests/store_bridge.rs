//! Test: store_bridge
//!
//! Purpose
//! - Validate that the bridge bootstraps the state from the store listing and then
//!   follows live changes of all three document families.
//! - Validate last-write-wins: replayed and out of order events never roll a key back.
//! - Validate that malformed documents are skipped without touching other entries.
//!
//! Flow
//! - Seed a MemoryStore, start the discovery service, then mutate the store (or feed
//!   crafted watch events) and observe the load balancer state.

mod common;

use std::time::Duration;

use common::{
    eventually, executor, fast_config, host, put_service, put_uri, ring_uris, seed, shared,
    uri_path, CLUSTER, SERVICE,
};
use waypoint_balancer::{Lifecycle, ServiceProperties, StrategyProperties, UriAnnouncement};
use waypoint_discovery::{DiscoveryError, DiscoveryService, StoreKey};
use waypoint_metadata_store::{MemoryStore, MetadataStore, WatchEvent};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test(start_paused = true)]
async fn bootstrap_loads_the_listing() {
    let store = MemoryStore::default();
    seed(&store, 3).await;

    let executor = executor();
    let owned = executor.state().clone();
    let state = &owned;
    let mut service = DiscoveryService::new(shared(&store), executor, fast_config());
    let _stream = service.bootstrap().await.unwrap();

    assert_eq!(state.lifecycle(), Lifecycle::Steady);
    assert_eq!(ring_uris(state), vec![host(0), host(1), host(2)]);
    assert!(state.service_properties(SERVICE).is_some());
}

#[tokio::test(start_paused = true)]
async fn live_changes_reach_the_ring() {
    let store = MemoryStore::default();
    seed(&store, 2).await;

    let executor = executor();
    let owned = executor.state().clone();
    let state = &owned;
    let handle = DiscoveryService::start(shared(&store), executor, fast_config())
        .await
        .unwrap();
    assert!(handle.is_connected());

    put_uri(&store, "node-9", &UriAnnouncement::new(host(9))).await;
    assert!(eventually(WAIT, || async move { ring_uris(state).len() == 3 }).await);

    store.delete(&uri_path("node-0")).await.unwrap();
    assert!(eventually(WAIT, || async move { ring_uris(state) == vec![host(1), host(9)] }).await);

    // a node moving to another uri withdraws the old one
    put_uri(&store, "node-1", &UriAnnouncement::new(host(7))).await;
    assert!(eventually(WAIT, || async move { ring_uris(state) == vec![host(7), host(9)] }).await);

    store
        .delete(&StoreKey::Service(SERVICE.to_string()).path())
        .await
        .unwrap();
    assert!(eventually(WAIT, || async move { state.service_properties(SERVICE).is_none() }).await);
    assert!(handle.is_running());
}

#[tokio::test(start_paused = true)]
async fn stale_events_never_roll_a_key_back() {
    let store = MemoryStore::default();
    seed(&store, 1).await;

    let executor = executor();
    let owned = executor.state().clone();
    let state = &owned;
    let mut service = DiscoveryService::new(shared(&store), executor, fast_config());
    let _stream = service.bootstrap().await.unwrap();
    let listed = store.revision();

    let announce = |revision: i64, weight: f64| WatchEvent::Put {
        key: uri_path("node-0").into_bytes(),
        value: serde_json::to_vec(&UriAnnouncement::new(host(0)).with_weight(0, weight)).unwrap(),
        mod_revision: Some(revision),
        version: None,
    };

    // replay of a write older than the listing
    service.handle_event(announce(listed - 1, 0.0)).await.unwrap();
    assert_eq!(ring_uris(state), vec![host(0)]);

    service.handle_event(announce(listed + 2, 2.0)).await.unwrap();
    let points = state
        .get_partition_state(SERVICE, 0)
        .unwrap()
        .unwrap()
        .points(&host(0));

    // arrives late, carries an older revision
    service.handle_event(announce(listed + 1, 0.0)).await.unwrap();
    let after = state
        .get_partition_state(SERVICE, 0)
        .unwrap()
        .unwrap()
        .points(&host(0));
    assert_eq!(points, after);
    assert_eq!(ring_uris(state), vec![host(0)]);

    // a delete older than the last put is dropped as well
    let late_delete = WatchEvent::Delete {
        key: uri_path("node-0").into_bytes(),
        mod_revision: Some(listed + 1),
        version: None,
    };
    service.handle_event(late_delete).await.unwrap();
    assert_eq!(ring_uris(state), vec![host(0)]);

    let delete = WatchEvent::Delete {
        key: uri_path("node-0").into_bytes(),
        mod_revision: Some(listed + 3),
        version: None,
    };
    service.handle_event(delete).await.unwrap();
    assert!(ring_uris(state).is_empty());

    // the put that lost the race stays dropped after the delete
    service.handle_event(announce(listed + 2, 1.0)).await.unwrap();
    assert!(ring_uris(state).is_empty());
}

#[tokio::test(start_paused = true)]
async fn malformed_documents_are_skipped() {
    let store = MemoryStore::default();
    seed(&store, 2).await;
    let other = ServiceProperties::new("other", CLUSTER, StrategyProperties::default());
    put_service(&store, &other).await;

    let executor = executor();
    let owned = executor.state().clone();
    let state = &owned;
    let mut service = DiscoveryService::new(shared(&store), executor, fast_config());
    let _stream = service.bootstrap().await.unwrap();
    let before = state.service_properties(SERVICE).unwrap();

    let bad = WatchEvent::Put {
        key: StoreKey::Service(SERVICE.to_string()).path().into_bytes(),
        value: br#"{"service_name":"svc","cluster_name":"cluster-1","strategy":{"type":"bogus"}}"#
            .to_vec(),
        mod_revision: Some(store.revision() + 1),
        version: None,
    };
    let err = service.handle_event(bad).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::MalformedDocument { .. }));
    assert_eq!(state.service_properties(SERVICE), Some(before));
    assert!(state.service_properties("other").is_some());

    let unknown = WatchEvent::Put {
        key: b"/waypoint/routes/r1".to_vec(),
        value: b"{}".to_vec(),
        mod_revision: Some(store.revision() + 2),
        version: None,
    };
    let err = service.handle_event(unknown).await.unwrap_err();
    assert!(matches!(err, DiscoveryError::MalformedKey(_)));
    assert_eq!(ring_uris(state).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_listing_entry_keeps_the_previous_value() {
    let store = MemoryStore::default();
    seed(&store, 1).await;

    let executor = executor();
    let owned = executor.state().clone();
    let state = &owned;
    let mut service = DiscoveryService::new(shared(&store), executor, fast_config());
    let _stream = service.bootstrap().await.unwrap();

    let path = StoreKey::Service(SERVICE.to_string()).path();
    store
        .put(&path, serde_json::json!({ "service_name": 42 }))
        .await
        .unwrap();
    service.resync().await.unwrap();

    assert!(state.service_properties(SERVICE).is_some());
    assert_eq!(ring_uris(state), vec![host(0)]);
}

#[tokio::test(start_paused = true)]
async fn lagging_watch_resyncs_from_the_listing() {
    let store = MemoryStore::with_watch_capacity(2);
    seed(&store, 1).await;

    let executor = executor();
    let owned = executor.state().clone();
    let state = &owned;
    let _handle = DiscoveryService::start(shared(&store), executor, fast_config())
        .await
        .unwrap();

    // no await point between the writes, the bridge falls behind
    for i in 1..10 {
        put_uri(&store, &format!("node-{i}"), &UriAnnouncement::new(host(i))).await;
    }
    assert!(eventually(WAIT, || async move { ring_uris(state).len() == 10 }).await);
}
