use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use crate::{
    errors::{MetadataError, Result},
    store::{KeyValueVersion, MetadataStore},
    watch::{WatchEvent, WatchStream},
};

const DEFAULT_WATCH_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    mod_revision: i64,
    version: i64,
    expires_at: Option<Instant>,
}

/// MemoryStore is an in-memory key-value store that implements the MetadataStore trait.
///
/// Keys are grouped by their first two path segments (`/waypoint/uris`), the remaining
/// segments form the key inside the group. Every write bumps a store-wide revision that is
/// carried by the watch events, and TTL keys are deleted once their lease runs out.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<DashMap<String, BTreeMap<String, Entry>>>,
    watchers: Arc<DashMap<u64, (String, broadcast::Sender<WatchEvent>)>>,
    revision: Arc<AtomicI64>,
    next_watcher: Arc<AtomicU64>,
    watch_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }
}

impl MemoryStore {
    pub async fn new() -> Result<Self> {
        Ok(MemoryStore::default())
    }

    /// Builds a store whose watch channels buffer at most `capacity` events per watcher.
    pub fn with_watch_capacity(capacity: usize) -> Self {
        MemoryStore {
            inner: Arc::new(DashMap::new()),
            watchers: Arc::new(DashMap::new()),
            revision: Arc::new(AtomicI64::new(0)),
            next_watcher: Arc::new(AtomicU64::new(0)),
            watch_capacity: capacity.max(1),
        }
    }

    /// Current store-wide revision (revision of the last write).
    pub fn revision(&self) -> i64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Drops every watch sender, ending all open watch streams.
    ///
    /// Stands in for a lost connection to the coordination service.
    pub fn disconnect_watchers(&self) {
        self.watchers.clear();
    }

    /// Number of watch streams currently registered.
    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    // watchers whose streams were dropped are forgotten here
    fn notify_watchers(&self, event: WatchEvent) {
        let path = event.path().into_owned();
        self.watchers.retain(|_, (prefix, tx)| {
            if path.starts_with(prefix.as_str()) {
                tx.send(event.clone()).is_ok()
            } else {
                tx.receiver_count() > 0
            }
        });
    }

    fn next_revision(&self) -> i64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn write(&self, path: &str, value: Value, ttl: Option<Duration>) -> Result<i64> {
        let (map_key, key) = split_path(path)?;
        if key.is_empty() {
            return Err(MetadataError::InvalidArguments(format!(
                "Path must have a key component: {}",
                path
            )));
        }

        let value_bytes = serde_json::to_vec(&value)?;
        let (mod_revision, version) = {
            let mut bmap = self.inner.entry(map_key).or_default();
            let mod_revision = self.next_revision();
            let version = bmap.get(&key).map(|e| e.version + 1).unwrap_or(1);
            bmap.insert(
                key,
                Entry {
                    value,
                    mod_revision,
                    version,
                    expires_at: ttl.map(|ttl| Instant::now() + ttl),
                },
            );
            (mod_revision, version)
        };

        self.notify_watchers(WatchEvent::Put {
            key: path.as_bytes().to_vec(),
            value: value_bytes,
            mod_revision: Some(mod_revision),
            version: Some(version),
        });

        Ok(mod_revision)
    }

    /// Removes `path`; when `only_revision` is set the key is removed only if it was not
    /// rewritten since that revision.
    fn remove(&self, path: &str, only_revision: Option<i64>) -> Result<bool> {
        let (map_key, key) = split_path(path)?;
        if key.is_empty() {
            return Err(MetadataError::InvalidArguments(format!(
                "Path must have a key component: {}",
                path
            )));
        }

        let removed = {
            let Some(mut bmap) = self.inner.get_mut(&map_key) else {
                return Ok(false);
            };
            match (bmap.get(&key), only_revision) {
                (None, _) => None,
                (Some(entry), Some(rev)) if entry.mod_revision != rev => None,
                (Some(_), _) => {
                    let entry = bmap.remove(&key);
                    entry.map(|e| (self.next_revision(), e.version))
                }
            }
        };

        match removed {
            Some((mod_revision, version)) => {
                self.notify_watchers(WatchEvent::Delete {
                    key: path.as_bytes().to_vec(),
                    mod_revision: Some(mod_revision),
                    version: Some(version),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn lease_deadline(&self, path: &str, mod_revision: i64) -> Option<Instant> {
        let (map_key, key) = split_path(path).ok()?;
        let bmap = self.inner.get(&map_key)?;
        let entry = bmap.get(&key)?;
        if entry.mod_revision != mod_revision {
            return None;
        }
        entry.expires_at
    }

    fn schedule_expiry(&self, path: String, mod_revision: i64) {
        let store = self.clone();
        tokio::spawn(async move {
            // keep_alive moves the deadline forward, so re-read it after every wake up
            while let Some(deadline) = store.lease_deadline(&path, mod_revision) {
                if Instant::now() >= deadline {
                    if let Ok(true) = store.remove(&path, Some(mod_revision)) {
                        trace!(key = %path, "ephemeral key expired");
                    }
                    return;
                }
                tokio::time::sleep_until(deadline).await;
            }
        });
    }
}

fn split_path(path: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = path.split('/').collect();

    // Validate that path has at least 3 parts (empty, namespace, category)
    if parts.len() < 3 || !parts[0].is_empty() {
        return Err(MetadataError::InvalidArguments(format!(
            "Path must have at least 3 segments: {}",
            path
        )));
    }

    let map_key = parts[..3].join("/");
    let key = parts[3..].join("/");
    Ok((map_key, key))
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>> {
        let (map_key, key) = split_path(path)?;
        Ok(self
            .inner
            .get(&map_key)
            .and_then(|bmap| bmap.get(&key).map(|e| e.value.clone())))
    }

    async fn put(&self, path: &str, value: Value) -> Result<()> {
        self.write(path, value, None)?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.remove(path, None)?;
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let (tx, rx) = broadcast::channel(self.watch_capacity);
        let id = self.next_watcher.fetch_add(1, Ordering::SeqCst);
        self.watchers.insert(id, (prefix.to_string(), tx));
        Ok(WatchStream::from_broadcast(rx))
    }

    async fn put_with_ttl(&self, path: &str, value: Value, ttl: Duration) -> Result<()> {
        let mod_revision = self.write(path, value, Some(ttl))?;
        self.schedule_expiry(path.to_string(), mod_revision);
        Ok(())
    }

    async fn keep_alive(&self, path: &str, ttl: Duration) -> Result<()> {
        let (map_key, key) = split_path(path)?;
        let mut bmap = self
            .inner
            .get_mut(&map_key)
            .ok_or_else(|| MetadataError::KeyNotFound(path.to_string()))?;
        let entry = bmap
            .get_mut(&key)
            .ok_or_else(|| MetadataError::KeyNotFound(path.to_string()))?;
        if entry.expires_at.is_none() {
            return Err(MetadataError::InvalidArguments(format!(
                "key is not ephemeral: {}",
                path
            )));
        }
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn get_bulk(&self, prefix: &str) -> Result<Vec<KeyValueVersion>> {
        let (map_key, suffix) = split_path(prefix.trim_end_matches('/'))?;

        let mut out: Vec<KeyValueVersion> = Vec::new();
        if let Some(bmap_ref) = self.inner.get(&map_key) {
            for (k, entry) in bmap_ref.iter() {
                if k.starts_with(&suffix) {
                    out.push(KeyValueVersion {
                        key: format!("{}/{}", map_key, k),
                        value: serde_json::to_vec(&entry.value)?,
                        mod_revision: entry.mod_revision,
                        version: entry.version,
                    });
                }
            }
        }
        Ok(out)
    }
}
