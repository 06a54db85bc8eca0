use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use waypoint_balancer::{ClusterProperties, ServiceProperties, StateConfig, UriAnnouncement};
use waypoint_discovery::DiscoveryConfig;

/// simulation settings loaded from the YAML file
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LoadConfiguration {
    /// Length of one reporting interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub(crate) interval_ms: u64,
    /// Calls issued to every service during one interval
    #[serde(default = "default_calls")]
    pub(crate) calls_per_interval: usize,
    /// Load balancer state settings
    #[serde(default)]
    pub(crate) state: StateConfig,
    /// Store bridge and announcer settings
    #[serde(default)]
    pub(crate) discovery: DiscoveryConfig,
    pub(crate) clusters: Vec<ClusterProperties>,
    pub(crate) services: Vec<ServiceProperties>,
    pub(crate) endpoints: Vec<EndpointProfile>,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_calls() -> usize {
    1000
}

/// A simulated host: where it announces itself and how it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EndpointProfile {
    pub(crate) cluster: String,
    pub(crate) node: String,
    pub(crate) uri: String,
    /// Partition id to weight, partition 0 with weight 1 when left out
    #[serde(default)]
    pub(crate) partitions: BTreeMap<u32, f64>,
    pub(crate) latency_ms: u64,
    #[serde(default)]
    pub(crate) error_rate: f64,
    /// Degraded behavior during a range of intervals
    #[serde(default)]
    pub(crate) incident: Option<Incident>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Incident {
    /// First degraded interval, counted from 1
    pub(crate) from: usize,
    /// Last degraded interval, inclusive
    pub(crate) until: usize,
    pub(crate) latency_ms: u64,
    #[serde(default)]
    pub(crate) error_rate: f64,
}

/// Validated simulation input
#[derive(Debug)]
pub(crate) struct SimulationConfig {
    pub(crate) interval: Duration,
    pub(crate) calls_per_interval: usize,
    pub(crate) state: StateConfig,
    pub(crate) discovery: DiscoveryConfig,
    pub(crate) clusters: Vec<ClusterProperties>,
    pub(crate) services: Vec<ServiceProperties>,
    pub(crate) endpoints: Vec<EndpointProfile>,
}

impl EndpointProfile {
    pub(crate) fn announcement(&self) -> UriAnnouncement {
        let announcement = UriAnnouncement::new(self.uri.clone());
        if self.partitions.is_empty() {
            announcement
        } else {
            announcement.with_partitions(self.partitions.clone())
        }
    }

    /// Latency and error rate the host shows during `interval`.
    pub(crate) fn behavior(&self, interval: usize) -> (Duration, f64) {
        match &self.incident {
            Some(incident) if (incident.from..=incident.until).contains(&interval) => (
                Duration::from_millis(incident.latency_ms),
                incident.error_rate,
            ),
            _ => (Duration::from_millis(self.latency_ms), self.error_rate),
        }
    }
}

fn check_rate(rate: f64, what: &str) -> Result<()> {
    if !(0.0..=1.0).contains(&rate) {
        return Err(anyhow!("{} error rate {} is outside [0, 1]", what, rate));
    }
    Ok(())
}

impl TryFrom<LoadConfiguration> for SimulationConfig {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        if config.interval_ms == 0 {
            return Err(anyhow!("interval_ms must be positive"));
        }
        config.state.validate()?;
        config.discovery.validate()?;

        let mut clusters = BTreeSet::new();
        for cluster in &config.clusters {
            cluster.validate()?;
            if !clusters.insert(cluster.cluster_name.as_str()) {
                return Err(anyhow!("cluster {} is defined twice", cluster.cluster_name));
            }
        }
        for service in &config.services {
            service.validate()?;
            if !clusters.contains(service.cluster_name.as_str()) {
                return Err(anyhow!(
                    "service {} points at unknown cluster {}",
                    service.service_name,
                    service.cluster_name
                ));
            }
        }

        let mut nodes = BTreeSet::new();
        for endpoint in &config.endpoints {
            if !clusters.contains(endpoint.cluster.as_str()) {
                return Err(anyhow!(
                    "endpoint {} announces into unknown cluster {}",
                    endpoint.uri,
                    endpoint.cluster
                ));
            }
            if !nodes.insert((endpoint.cluster.as_str(), endpoint.node.as_str())) {
                return Err(anyhow!(
                    "node {} is defined twice in cluster {}",
                    endpoint.node,
                    endpoint.cluster
                ));
            }
            endpoint.announcement().validate()?;
            check_rate(endpoint.error_rate, &endpoint.uri)?;
            if let Some(incident) = &endpoint.incident {
                if incident.from == 0 || incident.until < incident.from {
                    return Err(anyhow!(
                        "incident of {} has an empty interval range",
                        endpoint.uri
                    ));
                }
                check_rate(incident.error_rate, &endpoint.uri)?;
            }
        }

        Ok(SimulationConfig {
            interval: Duration::from_millis(config.interval_ms),
            calls_per_interval: config.calls_per_interval,
            state: config.state,
            discovery: config.discovery,
            clusters: config.clusters,
            services: config.services,
            endpoints: config.endpoints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../config/sim.yaml");

    #[test]
    fn bundled_configuration_is_valid() {
        let load: LoadConfiguration = serde_yaml::from_str(SAMPLE).unwrap();
        let config = SimulationConfig::try_from(load).unwrap();
        assert!(!config.endpoints.is_empty());
        assert!(config.endpoints.iter().any(|e| e.incident.is_some()));
    }

    #[test]
    fn unknown_cluster_is_rejected() {
        let yaml = r#"
clusters:
  - cluster_name: c1
services:
  - service_name: s
    cluster_name: c2
    strategy:
      type: degrader
endpoints: []
"#;
        let load: LoadConfiguration = serde_yaml::from_str(yaml).unwrap();
        let err = SimulationConfig::try_from(load).unwrap_err();
        assert!(err.to_string().contains("unknown cluster c2"));
    }

    #[test]
    fn incident_applies_inside_its_range() {
        let profile = EndpointProfile {
            cluster: "c1".into(),
            node: "n1".into(),
            uri: "http://a:1".into(),
            partitions: BTreeMap::new(),
            latency_ms: 10,
            error_rate: 0.0,
            incident: Some(Incident {
                from: 2,
                until: 3,
                latency_ms: 400,
                error_rate: 0.5,
            }),
        };
        assert_eq!(profile.behavior(1), (Duration::from_millis(10), 0.0));
        assert_eq!(profile.behavior(3), (Duration::from_millis(400), 0.5));
        assert_eq!(profile.behavior(4), (Duration::from_millis(10), 0.0));
    }
}
