//! Test: feed_loss
//!
//! Purpose
//! - Validate that losing the watch feed keeps routing on the last snapshot, flags the
//!   state stale once the outage outlasts the threshold, and that reconnecting resyncs
//!   the changes made meanwhile and clears the flag.
//!
//! Flow
//! - Start the discovery service on a store that can be cut off.
//! - Cut the store, wait for the stale flag, write while it is down.
//! - Restore the store and wait for the resync.

mod common;

use std::time::Duration;
use tokio::time::sleep;

use common::{eventually, executor, fast_config, host, put_uri, ring_uris, seed, shared, FlakyStore};
use waypoint_balancer::UriAnnouncement;
use waypoint_discovery::DiscoveryService;

#[tokio::test(start_paused = true)]
async fn outage_marks_stale_and_reconnect_resyncs() {
    let store = FlakyStore::default();
    seed(&store, 2).await;

    let executor = executor();
    let owned = executor.state().clone();
    let state = &owned;
    let handle = DiscoveryService::start(shared(&store), executor, fast_config())
        .await
        .unwrap();
    assert!(!state.is_stale());

    store.cut();
    // below the threshold nothing is flagged yet
    sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_connected());
    assert!(!state.is_stale());

    assert!(eventually(Duration::from_secs(2), || async move { state.is_stale() }).await);
    // routing keeps serving the last known members
    assert_eq!(ring_uris(state), vec![host(0), host(1)]);

    // written while the bridge is blind
    put_uri(&store, "node-5", &UriAnnouncement::new(host(5))).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(ring_uris(state).len(), 2);

    store.restore();
    assert!(
        eventually(Duration::from_secs(2), || async move {
            !state.is_stale() && ring_uris(state).len() == 3
        })
        .await
    );
    assert!(handle.is_connected());
    assert!(handle.is_running());
}

#[tokio::test(start_paused = true)]
async fn short_blip_never_marks_stale() {
    let store = FlakyStore::default();
    seed(&store, 1).await;

    let executor = executor();
    let owned = executor.state().clone();
    let state = &owned;
    let handle = DiscoveryService::start(shared(&store), executor, fast_config())
        .await
        .unwrap();

    // the feed closes but the store answers again right away
    store.inner.disconnect_watchers();
    sleep(Duration::from_secs(1)).await;
    assert!(handle.is_connected());
    assert!(!state.is_stale());
    assert_eq!(ring_uris(state), vec![host(0)]);
}
