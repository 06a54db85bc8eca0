use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};
use waypoint_balancer::StateExecutor;

/// Connection status of the watch feed, shared by the bridge and the watchdog.
#[derive(Debug, Default)]
pub struct FeedStatus {
    disconnected_since: Mutex<Option<Instant>>,
}

impl FeedStatus {
    /// Records the loss of the feed. A second call keeps the first timestamp.
    pub fn disconnected(&self, now: Instant) {
        if let Ok(mut since) = self.disconnected_since.lock() {
            since.get_or_insert(now);
        }
    }

    pub fn connected(&self) {
        if let Ok(mut since) = self.disconnected_since.lock() {
            *since = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.disconnected_for(Instant::now()).is_none()
    }

    pub fn disconnected_for(&self, now: Instant) -> Option<Duration> {
        self.disconnected_since
            .lock()
            .ok()
            .and_then(|since| since.map(|since| now.saturating_duration_since(since)))
    }
}

/// Flags the state stale once the feed stayed down past `threshold`, and fresh again
/// once it is back. Ends when the executor stops accepting commands.
pub(crate) async fn run_watchdog(
    feed: Arc<FeedStatus>,
    executor: StateExecutor,
    check_interval: Duration,
    threshold: Duration,
) {
    let mut ticker = interval(check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let stale = feed
            .disconnected_for(Instant::now())
            .map(|down| down >= threshold)
            .unwrap_or(false);
        trace!(stale, "stale feed check");
        if stale != executor.state().is_stale() && executor.set_stale(stale).await.is_err() {
            debug!("state executor closed, stopping the stale feed watchdog");
            break;
        }
    }
}
