use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetadataError>;

#[derive(Error, Debug)]
pub enum MetadataError {
    /// The watcher fell behind the store and missed events.
    #[error("watch lagged by {0} events, consumer should resync")]
    WatchLagged(u64),

    /// The backend could not be reached or refused the request.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MetadataError {
    /// Lag errors mean the watcher has to resync from a listing.
    pub fn is_lagged(&self) -> bool {
        matches!(self, MetadataError::WatchLagged(_))
    }
}
