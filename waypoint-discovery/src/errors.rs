use thiserror::Error;
use waypoint_balancer::BalancerError;
use waypoint_metadata_store::MetadataError;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Metadata store error: {0}")]
    Store(#[from] MetadataError),

    #[error("Load balancer error: {0}")]
    Balancer(#[from] BalancerError),

    /// A key under the waypoint root that matches none of the known path families.
    #[error("Malformed key: {0}")]
    MalformedKey(String),

    #[error("Malformed document at {key}: {reason}")]
    MalformedDocument { key: String, reason: String },

    #[error("Invalid discovery configuration: {0}")]
    Configuration(String),

    /// The state executor stopped accepting commands.
    #[error("State executor closed")]
    ExecutorClosed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
