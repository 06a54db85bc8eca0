mod announcer;
pub use announcer::Announcer;

mod bridge;
pub use bridge::{DiscoveryHandle, DiscoveryService};

mod config;
pub use config::DiscoveryConfig;

mod errors;
pub use errors::{DiscoveryError, Result};

pub mod paths;
pub use paths::StoreKey;

mod watchdog;
pub use watchdog::FeedStatus;
