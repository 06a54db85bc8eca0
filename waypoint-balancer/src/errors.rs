use thiserror::Error;

pub type Result<T> = std::result::Result<T, BalancerError>;

#[derive(Debug, Error)]
pub enum BalancerError {
    /// Malformed cluster or service properties; the previous valid config is retained.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The selected ring is empty or fully quarantined. A normal outcome, not a failure.
    #[error("No endpoint available for service {service} partition {partition_id}")]
    NoEndpointAvailable { service: String, partition_id: u32 },

    #[error("Partition routing error: {0}")]
    PartitionRouting(String),

    #[error("State is stale: {0}")]
    StaleState(String),

    #[error("Strategy internal error for {endpoint}: {reason}")]
    StrategyInternal { endpoint: String, reason: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Scheme {scheme} is not supported by service {service}")]
    UnsupportedScheme { service: String, scheme: String },

    /// The call was shed by the service's override drop rate before endpoint selection.
    #[error("Call to service {service} dropped (override drop rate {drop_rate:.2})")]
    CallDropped { service: String, drop_rate: f64 },

    #[error("Load balancer state is shutting down")]
    ShuttingDown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BalancerError {
    /// Errors a caller is expected to handle as part of normal routing.
    pub fn is_routing_outcome(&self) -> bool {
        matches!(
            self,
            BalancerError::NoEndpointAvailable { .. } | BalancerError::CallDropped { .. }
        )
    }
}
