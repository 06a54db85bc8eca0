use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::errors::Result;
use crate::watch::WatchStream;

/// An entry of a prefix listing.
///
/// `mod_revision` is the store-wide revision of the last write to the key, the
/// same ordering the watch feed carries, so a listing and the live events can
/// be reconciled with last-write-wins.
#[derive(Debug, Clone)]
pub struct KeyValueVersion {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
    pub version: i64,
}

/// Hierarchical key/value coordination store holding cluster, service and
/// URI documents under `/waypoint`.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn put(&self, key: &str, value: Value) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Changes of every key starting with `prefix`, from now on.
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;

    /// Ephemeral put: the key is deleted after `ttl` unless renewed with
    /// `keep_alive` or written again.
    async fn put_with_ttl(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// Extends the lease of an ephemeral key without rewriting it.
    async fn keep_alive(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Every key under `prefix` with its value and revisions.
    async fn get_bulk(&self, prefix: &str) -> Result<Vec<KeyValueVersion>>;
}
