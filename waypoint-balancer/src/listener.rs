use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::partition_state::{Endpoint, HealthStatus};
use crate::properties::{ClusterProperties, ServiceProperties};
use crate::state::Lifecycle;

/// Change notification delivered to listeners. Carries stable identifiers and,
/// for registry changes, the before/after values.
#[derive(Debug, Clone)]
pub enum StateEvent {
    ClusterUpdated {
        cluster: String,
        previous: Option<Arc<ClusterProperties>>,
        current: Arc<ClusterProperties>,
        version: u64,
    },
    ClusterRemoved {
        cluster: String,
        previous: Arc<ClusterProperties>,
        version: u64,
    },
    ServiceUpdated {
        service: String,
        previous: Option<Arc<ServiceProperties>>,
        current: Arc<ServiceProperties>,
        version: u64,
    },
    ServiceRemoved {
        service: String,
        previous: Arc<ServiceProperties>,
        version: u64,
    },
    MembershipChanged {
        cluster: String,
        uri: String,
        previous: Option<Endpoint>,
        current: Option<Endpoint>,
        generation: u64,
        version: u64,
    },
    RingRebuilt {
        service: String,
        partition_id: u32,
        generation: u64,
        sequence: u64,
        total_points: usize,
        endpoint_count: usize,
        unhealthy_count: usize,
        quarantined_count: usize,
    },
    QuarantineTransition {
        service: String,
        partition_id: u32,
        uri: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    DropRateChanged {
        service: String,
        partition_id: u32,
        previous: f64,
        current: f64,
    },
    StaleChanged {
        stale: bool,
    },
    LifecycleChanged {
        previous: Lifecycle,
        current: Lifecycle,
    },
}

/// Observer of state changes. Called from the dispatcher task, never from the
/// mutation or routing path; a slow listener only delays other listeners.
pub trait StateListener: Send + Sync + 'static {
    fn on_event(&self, event: &StateEvent);
}

enum DispatchMessage {
    Event(StateEvent),
    Flush(oneshot::Sender<()>),
}

type Listeners = Arc<ArcSwap<Vec<Arc<dyn StateListener>>>>;

/// Fire-and-forget fan-out of StateEvents over a bounded queue.
///
/// `emit` never waits: when the queue is full the event is dropped and counted.
/// A single task drains the queue and calls the listeners in subscription order.
#[derive(Clone)]
pub struct ListenerDispatcher {
    tx: mpsc::Sender<DispatchMessage>,
    listeners: Listeners,
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ListenerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerDispatcher")
            .field("listeners", &self.listeners.load().len())
            .field("dropped", &self.dropped_events())
            .finish()
    }
}

impl ListenerDispatcher {
    /// Spawns the dispatcher task; must be called inside a tokio runtime.
    pub fn start(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let listeners: Listeners = Arc::new(ArcSwap::from_pointee(Vec::new()));
        tokio::spawn(run(rx, Arc::clone(&listeners)));
        ListenerDispatcher {
            tx,
            listeners,
            dropped: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn StateListener>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&listener));
            next
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load().len()
    }

    /// Events lost because the queue was full or the dispatcher was closed
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn emit(&self, event: StateEvent) {
        if self.listeners.load().is_empty() {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.tx.try_send(DispatchMessage::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(dropped, "listener queue full, dropping state events");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Waits until every event queued before the call has been delivered.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(DispatchMessage::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Delivers what is queued, then refuses new events.
    pub async fn close(&self) {
        self.flush().await;
        self.closed.store(true, Ordering::Release);
    }
}

async fn run(mut rx: mpsc::Receiver<DispatchMessage>, listeners: Listeners) {
    while let Some(message) = rx.recv().await {
        match message {
            DispatchMessage::Event(event) => {
                let current = listeners.load();
                for listener in current.iter() {
                    listener.on_event(&event);
                }
            }
            DispatchMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    trace!("listener dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<StateEvent>>,
    }

    impl StateListener for Recorder {
        fn on_event(&self, event: &StateEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn delivers_events_in_order() {
        let dispatcher = ListenerDispatcher::start(16);
        let recorder = Arc::new(Recorder::default());
        dispatcher.subscribe(recorder.clone());

        dispatcher.emit(StateEvent::StaleChanged { stale: true });
        dispatcher.emit(StateEvent::StaleChanged { stale: false });
        dispatcher.flush().await;

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StateEvent::StaleChanged { stale: true }));
        assert!(matches!(events[1], StateEvent::StaleChanged { stale: false }));
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let dispatcher = ListenerDispatcher::start(2);
        let recorder = Arc::new(Recorder::default());
        dispatcher.subscribe(recorder.clone());

        // the dispatcher task cannot run before the first await on this runtime
        for _ in 0..50 {
            dispatcher.emit(StateEvent::StaleChanged { stale: true });
        }
        assert_eq!(dispatcher.dropped_events(), 48);

        dispatcher.flush().await;
        assert_eq!(recorder.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn closed_dispatcher_counts_events_as_dropped() {
        let dispatcher = ListenerDispatcher::start(4);
        dispatcher.subscribe(Arc::new(Recorder::default()));
        dispatcher.close().await;
        dispatcher.emit(StateEvent::StaleChanged { stale: true });
        assert_eq!(dispatcher.dropped_events(), 1);
    }
}
