use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::{DegraderConfig, RelativeConfig};
use crate::errors::{BalancerError, Result};

/// Schemes tried, in order, when neither the service nor its cluster lists any.
pub const DEFAULT_PRIORITIZED_SCHEMES: [&str; 2] = ["https", "http"];

/// Upper bound of the weight a host may announce for one partition.
pub const MAX_ANNOUNCED_WEIGHT: f64 = 100.0;

/// Hash applied to keys by hash partitioning
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// The key is parsed as an integer and taken modulo the partition count
    Modulo,
    /// SipHash of the key bytes modulo the partition count
    #[default]
    Sip,
}

/// How a cluster's keyspace is split into partitions
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionProperties {
    /// A single partition with id 0
    #[default]
    None,
    Hash {
        partition_count: u32,
        #[serde(default)]
        hash_algorithm: HashAlgorithm,
    },
    /// Integer keys, partition `(key - key_range_start) / partition_size`
    Range {
        key_range_start: i64,
        partition_size: i64,
        partition_count: u32,
    },
}

impl PartitionProperties {
    pub fn partition_count(&self) -> u32 {
        match self {
            PartitionProperties::None => 1,
            PartitionProperties::Hash {
                partition_count, ..
            }
            | PartitionProperties::Range {
                partition_count, ..
            } => *partition_count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            PartitionProperties::None => Ok(()),
            PartitionProperties::Hash {
                partition_count, ..
            } => {
                if *partition_count == 0 {
                    return Err(BalancerError::Configuration(
                        "hash partitioning needs at least one partition".to_string(),
                    ));
                }
                Ok(())
            }
            PartitionProperties::Range {
                partition_size,
                partition_count,
                ..
            } => {
                if *partition_count == 0 || *partition_size <= 0 {
                    return Err(BalancerError::Configuration(format!(
                        "range partitioning needs a positive count and size, got {} x {}",
                        partition_count, partition_size
                    )));
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ClusterProperties {
    pub cluster_name: String,
    #[serde(default)]
    pub partitioning: PartitionProperties,
    /// Canonical names of the services hosted by the cluster
    #[serde(default)]
    pub services: Vec<String>,
    /// URIs that never enter a ring of this cluster
    #[serde(default)]
    pub banned_uris: BTreeSet<String>,
    #[serde(default)]
    pub prioritized_schemes: Vec<String>,
}

impl ClusterProperties {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        ClusterProperties {
            cluster_name: cluster_name.into(),
            partitioning: PartitionProperties::None,
            services: Vec::new(),
            banned_uris: BTreeSet::new(),
            prioritized_schemes: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            return Err(BalancerError::Configuration(
                "cluster name must not be empty".to_string(),
            ));
        }
        self.partitioning.validate()?;
        validate_schemes(&self.prioritized_schemes)
    }
}

/// Strategy selected for a service, with its tunables
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyProperties {
    Degrader(DegraderConfig),
    Relative(RelativeConfig),
}

impl Default for StrategyProperties {
    fn default() -> Self {
        StrategyProperties::Degrader(DegraderConfig::default())
    }
}

impl StrategyProperties {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyProperties::Degrader(_) => "degrader",
            StrategyProperties::Relative(_) => "relative",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            StrategyProperties::Degrader(config) => config.validate(),
            StrategyProperties::Relative(config) => config.validate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServiceProperties {
    pub service_name: String,
    pub cluster_name: String,
    /// Path prefix of the service on its endpoints
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub strategy: StrategyProperties,
    #[serde(default)]
    pub prioritized_schemes: Vec<String>,
    #[serde(default)]
    pub banned_uris: BTreeSet<String>,
}

impl ServiceProperties {
    pub fn new(
        service_name: impl Into<String>,
        cluster_name: impl Into<String>,
        strategy: StrategyProperties,
    ) -> Self {
        ServiceProperties {
            service_name: service_name.into(),
            cluster_name: cluster_name.into(),
            path: String::new(),
            strategy,
            prioritized_schemes: Vec::new(),
            banned_uris: BTreeSet::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() || self.cluster_name.trim().is_empty() {
            return Err(BalancerError::Configuration(
                "service and cluster names must not be empty".to_string(),
            ));
        }
        validate_schemes(&self.prioritized_schemes)?;
        self.strategy.validate()
    }

    /// Schemes in the order they are tried: the service's own list, else the
    /// cluster's, else https then http.
    pub fn effective_schemes(&self, cluster: Option<&ClusterProperties>) -> Vec<String> {
        if !self.prioritized_schemes.is_empty() {
            return self.prioritized_schemes.clone();
        }
        match cluster {
            Some(c) if !c.prioritized_schemes.is_empty() => c.prioritized_schemes.clone(),
            _ => DEFAULT_PRIORITIZED_SCHEMES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

fn validate_schemes(schemes: &[String]) -> Result<()> {
    if let Some(bad) = schemes.iter().find(|s| s.is_empty() || s.contains(':')) {
        return Err(BalancerError::Configuration(format!(
            "invalid scheme '{}'",
            bad
        )));
    }
    Ok(())
}

fn default_partitions() -> BTreeMap<u32, f64> {
    BTreeMap::from([(0, 1.0)])
}

/// A host announcing itself as part of a cluster.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UriAnnouncement {
    pub uri: String,
    /// Partition id to weight; a weight of 0 keeps the host on standby
    #[serde(default = "default_partitions")]
    pub partitions: BTreeMap<u32, f64>,
    #[serde(default)]
    pub do_not_slow_start: bool,
}

impl UriAnnouncement {
    pub fn new(uri: impl Into<String>) -> Self {
        UriAnnouncement {
            uri: uri.into(),
            partitions: default_partitions(),
            do_not_slow_start: false,
        }
    }

    pub fn with_weight(mut self, partition_id: u32, weight: f64) -> Self {
        self.partitions.insert(partition_id, weight);
        self
    }

    pub fn with_partitions(mut self, partitions: BTreeMap<u32, f64>) -> Self {
        self.partitions = partitions;
        self
    }

    /// Scheme part of the URI
    pub fn scheme(&self) -> Result<&str> {
        match self.uri.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok(scheme),
            _ => Err(BalancerError::Configuration(format!(
                "announced uri '{}' has no scheme",
                self.uri
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.scheme()?;
        if let Some((id, weight)) = self
            .partitions
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0 || **w > MAX_ANNOUNCED_WEIGHT)
        {
            return Err(BalancerError::Configuration(format!(
                "uri {} has invalid weight {} for partition {}",
                self.uri, weight, id
            )));
        }
        Ok(())
    }
}
