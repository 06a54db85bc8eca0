//! # State Executor
//!
//! Single writer in front of a [`LoadBalancerState`]. Feeds (the discovery bridge,
//! tests, tools) send [`StateCommand`]s over an `mpsc::channel`; one spawned task
//! applies them in arrival order and answers each through a oneshot with the
//! resulting state version. Reads go straight to the state and never queue here.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::errors::{BalancerError, Result};
use crate::properties::{ClusterProperties, ServiceProperties};
use crate::state::{LoadBalancerState, StateSnapshot, UriChange};

/// Mutations of the state, applied one at a time by the executor task.
#[derive(Debug)]
pub enum StateCommand {
    /// Insert or replace a cluster's properties.
    UpdateCluster(ClusterProperties, oneshot::Sender<Result<u64>>),

    /// Forget a cluster's properties. Its announced URIs are kept.
    RemoveCluster(String, oneshot::Sender<Result<u64>>),

    /// Insert or replace a service's properties, keeping the strategy when its
    /// configuration is unchanged.
    UpdateService(ServiceProperties, oneshot::Sender<Result<u64>>),

    RemoveService(String, oneshot::Sender<Result<u64>>),

    /// Announcement or withdrawal of one URI of a cluster.
    UpdateUri {
        cluster: String,
        change: UriChange,
        ack: oneshot::Sender<Result<u64>>,
    },

    /// Reconcile with a full store listing (bootstrap and resync).
    ApplySnapshot(StateSnapshot, oneshot::Sender<Result<u64>>),

    /// Flag the feed as stale or fresh. Fire and forget.
    SetStale(bool),
}

impl StateCommand {
    fn kind(&self) -> &'static str {
        match self {
            StateCommand::UpdateCluster(..) => "update_cluster",
            StateCommand::RemoveCluster(..) => "remove_cluster",
            StateCommand::UpdateService(..) => "update_service",
            StateCommand::RemoveService(..) => "remove_service",
            StateCommand::UpdateUri { .. } => "update_uri",
            StateCommand::ApplySnapshot(..) => "apply_snapshot",
            StateCommand::SetStale(_) => "set_stale",
        }
    }
}

/// Handle to the executor task. Cloning it gives another sender.
#[derive(Debug, Clone)]
pub struct StateExecutor {
    tx: mpsc::Sender<StateCommand>,
    state: LoadBalancerState,
}

impl StateExecutor {
    /// Spawns the executor task; it stops once every handle is dropped.
    pub fn start(state: LoadBalancerState) -> (Self, JoinHandle<()>) {
        let capacity = state.config().executor_queue_capacity;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run(state.clone(), rx));
        (StateExecutor { tx, state }, handle)
    }

    pub fn state(&self) -> &LoadBalancerState {
        &self.state
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<u64>>) -> StateCommand,
    ) -> Result<u64> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(build(ack_tx))
            .await
            .map_err(|_| BalancerError::ShuttingDown)?;
        ack_rx.await.map_err(|_| BalancerError::ShuttingDown)?
    }

    pub async fn update_cluster(&self, properties: ClusterProperties) -> Result<u64> {
        self.request(|ack| StateCommand::UpdateCluster(properties, ack)).await
    }

    pub async fn remove_cluster(&self, cluster: impl Into<String>) -> Result<u64> {
        let cluster = cluster.into();
        self.request(|ack| StateCommand::RemoveCluster(cluster, ack)).await
    }

    pub async fn update_service(&self, properties: ServiceProperties) -> Result<u64> {
        self.request(|ack| StateCommand::UpdateService(properties, ack)).await
    }

    pub async fn remove_service(&self, service: impl Into<String>) -> Result<u64> {
        let service = service.into();
        self.request(|ack| StateCommand::RemoveService(service, ack)).await
    }

    pub async fn update_uri(&self, cluster: impl Into<String>, change: UriChange) -> Result<u64> {
        let cluster = cluster.into();
        self.request(|ack| StateCommand::UpdateUri {
            cluster,
            change,
            ack,
        })
        .await
    }

    pub async fn apply_snapshot(&self, snapshot: StateSnapshot) -> Result<u64> {
        self.request(|ack| StateCommand::ApplySnapshot(snapshot, ack)).await
    }

    pub async fn set_stale(&self, stale: bool) -> Result<()> {
        self.tx
            .send(StateCommand::SetStale(stale))
            .await
            .map_err(|_| BalancerError::ShuttingDown)
    }
}

async fn run(state: LoadBalancerState, mut rx: mpsc::Receiver<StateCommand>) {
    while let Some(command) = rx.recv().await {
        let kind = command.kind();
        trace!(command = kind, "applying state command");
        let (result, ack) = match command {
            StateCommand::UpdateCluster(properties, ack) => {
                (state.update_cluster_properties(properties).await, ack)
            }
            StateCommand::RemoveCluster(cluster, ack) => (state.remove_cluster(&cluster).await, ack),
            StateCommand::UpdateService(properties, ack) => {
                (state.update_service_properties(properties).await, ack)
            }
            StateCommand::RemoveService(service, ack) => (state.remove_service(&service).await, ack),
            StateCommand::UpdateUri {
                cluster,
                change,
                ack,
            } => (state.update_uri_announcement(&cluster, change).await, ack),
            StateCommand::ApplySnapshot(snapshot, ack) => (state.apply_snapshot(snapshot).await, ack),
            StateCommand::SetStale(stale) => {
                state.set_stale(stale);
                continue;
            }
        };
        if let Err(e) = &result {
            warn!(command = kind, error = %e, "state command rejected");
        }
        if ack.send(result).is_err() {
            debug!(command = kind, "state command requester went away");
        }
    }
    trace!("state executor stopped");
}
