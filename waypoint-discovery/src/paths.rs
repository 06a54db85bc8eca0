use std::fmt;

use crate::errors::{DiscoveryError, Result};

pub const BASE_PATH: &str = "/waypoint";
// Cluster properties, one document per cluster
pub const BASE_CLUSTERS_PATH: &str = "/waypoint/clusters";
// Service properties, one document per service
pub const BASE_SERVICES_PATH: &str = "/waypoint/services";
// Ephemeral announcements, /waypoint/uris/{cluster}/{node}
pub const BASE_URIS_PATH: &str = "/waypoint/uris";

pub fn join_path(parts: &[&str]) -> String {
    let mut result = String::new();
    for (i, part) in parts.iter().enumerate() {
        let part = if i == 0 { *part } else { part.trim_start_matches('/') };
        if !result.ends_with('/') && !result.is_empty() {
            result.push('/');
        }
        result.push_str(part);
    }
    result
}

/// The three document families the bridge understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Cluster(String),
    Service(String),
    Uri { cluster: String, node: String },
}

impl StoreKey {
    pub fn parse(key: &str) -> Result<Self> {
        let malformed = || DiscoveryError::MalformedKey(key.to_string());
        let rest = key
            .strip_prefix(BASE_PATH)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(malformed)?;
        let parts: Vec<&str> = rest.split('/').collect();
        if parts.iter().any(|part| part.is_empty()) {
            return Err(malformed());
        }

        match parts.as_slice() {
            ["clusters", cluster] => Ok(StoreKey::Cluster(cluster.to_string())),
            ["services", service] => Ok(StoreKey::Service(service.to_string())),
            ["uris", cluster, node] => Ok(StoreKey::Uri {
                cluster: cluster.to_string(),
                node: node.to_string(),
            }),
            _ => Err(malformed()),
        }
    }

    pub fn path(&self) -> String {
        match self {
            StoreKey::Cluster(cluster) => join_path(&[BASE_CLUSTERS_PATH, cluster]),
            StoreKey::Service(service) => join_path(&[BASE_SERVICES_PATH, service]),
            StoreKey::Uri { cluster, node } => join_path(&[BASE_URIS_PATH, cluster, node]),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_family() {
        assert_eq!(
            StoreKey::parse("/waypoint/clusters/c1").unwrap(),
            StoreKey::Cluster("c1".into())
        );
        assert_eq!(
            StoreKey::parse("/waypoint/services/svc").unwrap(),
            StoreKey::Service("svc".into())
        );
        let uri = StoreKey::parse("/waypoint/uris/c1/node-1").unwrap();
        assert_eq!(
            uri,
            StoreKey::Uri {
                cluster: "c1".into(),
                node: "node-1".into()
            }
        );
        assert_eq!(uri.path(), "/waypoint/uris/c1/node-1");
    }

    #[test]
    fn rejects_unknown_shapes() {
        for key in [
            "/waypoint/clusters",
            "/waypoint/clusters/",
            "/waypoint/uris/c1",
            "/waypoint/uris/c1/node/extra",
            "/waypoint/routes/r1",
            "/other/clusters/c1",
        ] {
            assert!(
                matches!(StoreKey::parse(key), Err(DiscoveryError::MalformedKey(_))),
                "{key}"
            );
        }
    }

    #[test]
    fn join_path_collapses_slashes() {
        assert_eq!(join_path(&[BASE_URIS_PATH, "c1", "n1"]), "/waypoint/uris/c1/n1");
        assert_eq!(join_path(&["/waypoint/", "/services", "s"]), "/waypoint/services/s");
    }
}
