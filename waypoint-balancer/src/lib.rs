pub mod balancer_metrics;

mod config;
pub use config::{
    CallTrackerConfig, DegraderConfig, QuarantineConfig, RelativeConfig, StateConfig,
    MAX_POINTS_PER_WEIGHT,
};

mod errors;
pub use errors::{BalancerError, Result};

mod executor;
pub use executor::{StateCommand, StateExecutor};

mod listener;
pub use listener::{ListenerDispatcher, StateEvent, StateListener};

mod partition;
pub use partition::{PartitionAccessor, Route};

mod partition_state;
pub use partition_state::{
    Endpoint, EndpointHealth, HealthStatus, LatencyAggregate, Member, PartitionMembers,
    PartitionState,
};

mod properties;
pub use properties::{
    ClusterProperties, HashAlgorithm, PartitionProperties, ServiceProperties, StrategyProperties,
    UriAnnouncement, DEFAULT_PRIORITIZED_SCHEMES, MAX_ANNOUNCED_WEIGHT,
};

pub mod ring;
pub use ring::{HashRing, RingMember};

mod state;
pub use state::{
    HostKeys, KeyMapping, LoadBalancerState, Lifecycle, StateSnapshot, StateStats, UriChange,
};

mod strategy;
pub use strategy::{
    DegraderStrategy, HealthProbe, LoadBalancerStrategy, NoopProbe, ProbeOutcome,
    RelativeStrategy, Strategy,
};

mod tracker;
pub use tracker::{CallHandle, CallStats, CallTracker, ErrorType, TrackerClient};
