use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use waypoint_balancer::UriAnnouncement;
use waypoint_metadata_store::{MetadataError, MetadataStore};

use crate::config::DiscoveryConfig;
use crate::errors::Result;
use crate::paths::StoreKey;

/// Server side helper keeping one URI announced under `/waypoint/uris/{cluster}/{node}`.
///
/// The announcement is written with a TTL and renewed in the background. Dropping the
/// announcer stops the renewals and lets the lease run out; `withdraw` removes it at once.
pub struct Announcer {
    store: Arc<dyn MetadataStore>,
    key: StoreKey,
    renewals: JoinHandle<()>,
}

impl Announcer {
    pub async fn announce(
        store: Arc<dyn MetadataStore>,
        cluster: &str,
        node: &str,
        announcement: UriAnnouncement,
        config: &DiscoveryConfig,
    ) -> Result<Self> {
        config.validate()?;
        announcement.validate()?;

        let key = StoreKey::Uri {
            cluster: cluster.to_string(),
            node: node.to_string(),
        };
        let path = key.path();
        let payload = serde_json::to_value(&announcement)?;
        let ttl = config.announce_ttl();

        store.put_with_ttl(&path, payload.clone(), ttl).await?;
        info!(
            cluster = %cluster,
            node = %node,
            uri = %announcement.uri,
            ttl_ms = config.announce_ttl_ms,
            "uri announced"
        );

        let renewals = tokio::spawn(renew(
            store.clone(),
            path,
            payload,
            ttl,
            config.keep_alive_interval(),
        ));

        Ok(Announcer {
            store,
            key,
            renewals,
        })
    }

    pub fn path(&self) -> String {
        self.key.path()
    }

    /// Stops the renewals and deletes the announcement.
    pub async fn withdraw(self) -> Result<()> {
        self.renewals.abort();
        let path = self.key.path();
        self.store.delete(&path).await?;
        info!(key = %path, "uri withdrawn");
        Ok(())
    }
}

impl std::fmt::Debug for Announcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Announcer")
            .field("key", &self.key)
            .field("renewing", &!self.renewals.is_finished())
            .finish()
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.renewals.abort();
    }
}

async fn renew(
    store: Arc<dyn MetadataStore>,
    path: String,
    payload: serde_json::Value,
    ttl: Duration,
    interval: Duration,
) {
    loop {
        sleep(interval).await;
        match store.keep_alive(&path, ttl).await {
            Ok(()) => debug!(key = %path, "announcement lease renewed"),
            Err(MetadataError::KeyNotFound(_)) => {
                // the lease ran out between two renewals, write it again
                warn!(key = %path, "announcement expired, announcing again");
                if let Err(e) = store.put_with_ttl(&path, payload.clone(), ttl).await {
                    error!(key = %path, error = %e, "failed to re-announce uri");
                    break;
                }
            }
            Err(e) => {
                error!(key = %path, error = %e, "failed to renew announcement lease");
                break;
            }
        }
    }
}
