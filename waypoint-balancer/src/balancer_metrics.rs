use metrics::{counter, gauge};

use crate::listener::{StateEvent, StateListener};

pub struct Metric {
    pub name: &'static str,
    pub description: &'static str,
}

pub const COUNTERS: [Metric; 5] = [
    STATE_UPDATES_TOTAL,
    MEMBERSHIP_CHANGES_TOTAL,
    RING_REBUILDS_TOTAL,
    QUARANTINE_TRANSITIONS_TOTAL,
    LIFECYCLE_TRANSITIONS_TOTAL,
];
pub const GAUGES: [Metric; 7] = [
    STATE_VERSION,
    STATE_STALE,
    PARTITION_RING_POINTS,
    PARTITION_ENDPOINTS,
    PARTITION_UNHEALTHY_ENDPOINTS,
    PARTITION_QUARANTINED_ENDPOINTS,
    PARTITION_DROP_RATE,
];

// STATE Metrics --------------------------

pub const STATE_UPDATES_TOTAL: Metric = Metric {
    name: "waypoint_state_updates_total",
    description: "Total registry updates applied, by kind (cluster/service, update/remove)",
};

pub const STATE_VERSION: Metric = Metric {
    name: "waypoint_state_version",
    description: "Current version of the load balancer state",
};

pub const STATE_STALE: Metric = Metric {
    name: "waypoint_state_stale",
    description: "Whether routing runs on a stale snapshot (0=fresh,1=stale)",
};

pub const LIFECYCLE_TRANSITIONS_TOTAL: Metric = Metric {
    name: "waypoint_lifecycle_transitions_total",
    description: "Total lifecycle transitions of the state, by target lifecycle",
};

pub const MEMBERSHIP_CHANGES_TOTAL: Metric = Metric {
    name: "waypoint_membership_changes_total",
    description: "Total announced URI changes per cluster",
};

// PARTITION Metrics --------------------------

pub const RING_REBUILDS_TOTAL: Metric = Metric {
    name: "waypoint_ring_rebuilds_total",
    description: "Total ring rebuilds per service partition",
};

pub const PARTITION_RING_POINTS: Metric = Metric {
    name: "waypoint_partition_ring_points",
    description: "Points on the rings of a service partition",
};

pub const PARTITION_ENDPOINTS: Metric = Metric {
    name: "waypoint_partition_endpoints",
    description: "Members of a service partition",
};

pub const PARTITION_UNHEALTHY_ENDPOINTS: Metric = Metric {
    name: "waypoint_partition_unhealthy_endpoints",
    description: "Members of a service partition scored below full health",
};

pub const PARTITION_QUARANTINED_ENDPOINTS: Metric = Metric {
    name: "waypoint_partition_quarantined_endpoints",
    description: "Members of a service partition held out of the ring by quarantine",
};

pub const PARTITION_DROP_RATE: Metric = Metric {
    name: "waypoint_partition_drop_rate",
    description: "Override drop rate of a service partition, in [0, 1]",
};

pub const QUARANTINE_TRANSITIONS_TOTAL: Metric = Metric {
    name: "waypoint_quarantine_transitions_total",
    description: "Total endpoint health transitions into or out of quarantine, by target status",
};

/// Registers descriptions for every metric of the catalog with the installed recorder.
pub fn describe_metrics() {
    for metric in COUNTERS {
        metrics::describe_counter!(metric.name, metric.description);
        let _counter = counter!(metric.name);
    }
    for metric in GAUGES {
        metrics::describe_gauge!(metric.name, metric.description);
        let _gauge = gauge!(metric.name);
    }
}

/// StateListener exporting state events through the `metrics` facade.
#[derive(Debug, Default)]
pub struct MetricsListener;

impl StateListener for MetricsListener {
    fn on_event(&self, event: &StateEvent) {
        match event {
            StateEvent::ClusterUpdated { version, .. } => {
                counter!(STATE_UPDATES_TOTAL.name, "kind" => "cluster_updated").increment(1);
                gauge!(STATE_VERSION.name).set(*version as f64);
            }
            StateEvent::ClusterRemoved { version, .. } => {
                counter!(STATE_UPDATES_TOTAL.name, "kind" => "cluster_removed").increment(1);
                gauge!(STATE_VERSION.name).set(*version as f64);
            }
            StateEvent::ServiceUpdated { version, .. } => {
                counter!(STATE_UPDATES_TOTAL.name, "kind" => "service_updated").increment(1);
                gauge!(STATE_VERSION.name).set(*version as f64);
            }
            StateEvent::ServiceRemoved { version, .. } => {
                counter!(STATE_UPDATES_TOTAL.name, "kind" => "service_removed").increment(1);
                gauge!(STATE_VERSION.name).set(*version as f64);
            }
            StateEvent::MembershipChanged {
                cluster, version, ..
            } => {
                counter!(MEMBERSHIP_CHANGES_TOTAL.name, "cluster" => cluster.clone()).increment(1);
                gauge!(STATE_VERSION.name).set(*version as f64);
            }
            StateEvent::RingRebuilt {
                service,
                partition_id,
                total_points,
                endpoint_count,
                unhealthy_count,
                quarantined_count,
                ..
            } => {
                let partition = partition_id.to_string();
                counter!(RING_REBUILDS_TOTAL.name, "service" => service.clone(), "partition" => partition.clone())
                    .increment(1);
                gauge!(PARTITION_RING_POINTS.name, "service" => service.clone(), "partition" => partition.clone())
                    .set(*total_points as f64);
                gauge!(PARTITION_ENDPOINTS.name, "service" => service.clone(), "partition" => partition.clone())
                    .set(*endpoint_count as f64);
                gauge!(PARTITION_UNHEALTHY_ENDPOINTS.name, "service" => service.clone(), "partition" => partition.clone())
                    .set(*unhealthy_count as f64);
                gauge!(PARTITION_QUARANTINED_ENDPOINTS.name, "service" => service.clone(), "partition" => partition)
                    .set(*quarantined_count as f64);
            }
            StateEvent::QuarantineTransition { service, to, .. } => {
                counter!(
                    QUARANTINE_TRANSITIONS_TOTAL.name,
                    "service" => service.clone(),
                    "to" => to.to_string()
                )
                .increment(1);
            }
            StateEvent::DropRateChanged {
                service,
                partition_id,
                current,
                ..
            } => {
                gauge!(
                    PARTITION_DROP_RATE.name,
                    "service" => service.clone(),
                    "partition" => partition_id.to_string()
                )
                .set(*current);
            }
            StateEvent::StaleChanged { stale } => {
                gauge!(STATE_STALE.name).set(if *stale { 1.0 } else { 0.0 });
            }
            StateEvent::LifecycleChanged { current, .. } => {
                counter!(LIFECYCLE_TRANSITIONS_TOTAL.name, "to" => current.to_string()).increment(1);
            }
        }
    }
}
