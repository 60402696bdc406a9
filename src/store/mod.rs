//! Storage Contracts
//!
//! Two tiers back the server:
//!
//! - [`Table`]: the durable tier. Point lookup, ordered range scan,
//!   single-row put/delete and a single-row conditional [`Table::update`]
//!   that is atomic per key.
//! - [`CacheStore`]: the cache tier. Byte values with a TTL.
//!
//! Neither tier offers transactions across keys. Callers that keep two rows
//! in step (the join projections, a pairing) do it with ordered writes,
//! retries and repair sweeps.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;
#[cfg(test)]
pub mod testing;

use std::future::Future;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub use memory::{MemoryCache, MemoryTable};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The operation did not complete in time.
    #[error("store operation '{op}' timed out after {after:?}")]
    Timeout {
        /// Operation name.
        op: &'static str,
        /// Configured bound.
        after: Duration,
    },

    /// The backend rejected or failed the operation.
    #[error("backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

/// Storage tuning.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on any single store call.
    pub op_timeout: Duration,
    /// Redis URL for the cache tier.
    pub redis_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(2),
            redis_url: None,
        }
    }
}

impl StoreConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            op_timeout: std::env::var("STORE_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.op_timeout),
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
        }
    }
}

// =============================================================================
// DURABLE TIER
// =============================================================================

/// Inclusive/exclusive key range for [`Table::scan`].
#[derive(Debug, Clone)]
pub struct KeyRange<K> {
    /// Lower bound.
    pub start: Bound<K>,
    /// Upper bound.
    pub end: Bound<K>,
}

impl<K: Ord> KeyRange<K> {
    /// Every key.
    pub fn all() -> Self {
        Self { start: Bound::Unbounded, end: Bound::Unbounded }
    }

    /// `[start, end)`.
    pub fn half_open(start: K, end: K) -> Self {
        Self { start: Bound::Included(start), end: Bound::Excluded(end) }
    }

    /// Keys strictly after `start`.
    pub fn after(start: K) -> Self {
        Self { start: Bound::Excluded(start), end: Bound::Unbounded }
    }

    /// Whether the range cannot contain any key.
    pub fn is_empty(&self) -> bool {
        use Bound::*;
        match (&self.start, &self.end) {
            (Included(s), Included(e)) => s > e,
            (Included(s) | Excluded(s), Included(e) | Excluded(e)) => s >= e,
            _ => false,
        }
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &K) -> bool {
        let above = match &self.start {
            Bound::Included(s) => key >= s,
            Bound::Excluded(s) => key > s,
            Bound::Unbounded => true,
        };
        let below = match &self.end {
            Bound::Included(e) => key <= e,
            Bound::Excluded(e) => key < e,
            Bound::Unbounded => true,
        };
        above && below
    }
}

/// Decision returned by an [`Table::update`] closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write<V> {
    /// Store this value.
    Put(V),
    /// Remove the row.
    Delete,
    /// Leave the row as it is.
    Keep,
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Updated<V> {
    /// Row before the update.
    pub previous: Option<V>,
    /// Row after the update.
    pub current: Option<V>,
    /// Whether anything was written.
    pub applied: bool,
}

/// Closure deciding a conditional update from the current row.
pub type UpdateFn<V> = Box<dyn FnOnce(Option<&V>) -> Write<V> + Send>;

/// Box an update closure.
pub fn decide<V, F>(f: F) -> UpdateFn<V>
where
    F: FnOnce(Option<&V>) -> Write<V> + Send + 'static,
{
    Box::new(f)
}

/// A durable, ordered table.
#[async_trait]
pub trait Table<K, V>: Send + Sync
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Point lookup.
    async fn get(&self, key: &K) -> Result<Option<V>, StoreError>;

    /// Insert or overwrite one row.
    async fn put(&self, key: K, value: V) -> Result<(), StoreError>;

    /// Remove one row. Removing a missing row succeeds.
    async fn delete(&self, key: &K) -> Result<(), StoreError>;

    /// Rows in key order within `range`, at most `limit`.
    async fn scan(&self, range: KeyRange<K>, limit: usize) -> Result<Vec<(K, V)>, StoreError>;

    /// Read-decide-write on one row, atomic with respect to every other
    /// operation on the same key.
    async fn update(&self, key: &K, decide: UpdateFn<V>) -> Result<Updated<V>, StoreError>;
}

/// Shared handle to a table.
pub type SharedTable<K, V> = Arc<dyn Table<K, V>>;

// =============================================================================
// CACHE TIER
// =============================================================================

/// A TTL key/value cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Fetch a live value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Remove a key. Removing a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Reset the TTL of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Drop entries whose TTL has passed. Backends that evict on their own
    /// return 0.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Encode a value for the cache tier.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Decode a value from the cache tier.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Run a store future under a deadline.
pub async fn with_timeout<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { op, after }),
    }
}

/// Wraps a store so every call is bounded by a deadline.
pub struct Timed<S: ?Sized> {
    after: Duration,
    inner: Arc<S>,
}

impl<S: ?Sized> Timed<S> {
    /// Bound every call on `inner` by `after`.
    pub fn new(inner: Arc<S>, after: Duration) -> Self {
        Self { after, inner }
    }
}

#[async_trait]
impl<K, V, S> Table<K, V> for Timed<S>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Table<K, V> + ?Sized,
{
    async fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        with_timeout("get", self.after, self.inner.get(key)).await
    }

    async fn put(&self, key: K, value: V) -> Result<(), StoreError> {
        with_timeout("put", self.after, self.inner.put(key, value)).await
    }

    async fn delete(&self, key: &K) -> Result<(), StoreError> {
        with_timeout("delete", self.after, self.inner.delete(key)).await
    }

    async fn scan(&self, range: KeyRange<K>, limit: usize) -> Result<Vec<(K, V)>, StoreError> {
        with_timeout("scan", self.after, self.inner.scan(range, limit)).await
    }

    async fn update(&self, key: &K, decide: UpdateFn<V>) -> Result<Updated<V>, StoreError> {
        with_timeout("update", self.after, self.inner.update(key, decide)).await
    }
}

#[async_trait]
impl<S: CacheStore + ?Sized> CacheStore for Timed<S> {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        with_timeout("cache_set", self.after, self.inner.set(key, value, ttl)).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        with_timeout("cache_get", self.after, self.inner.get(key)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        with_timeout("cache_delete", self.after, self.inner.delete(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        with_timeout("cache_expire", self.after, self.inner.expire(key, ttl)).await
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        with_timeout("cache_purge", self.after, self.inner.purge_expired()).await
    }
}

/// A fresh in-memory table behind the shared handle type.
pub fn memory_table<K, V>() -> SharedTable<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    Arc::new(MemoryTable::new())
}

/// Wrap a table with the configured deadline and erase its type.
pub fn timed_table<K, V, S>(inner: S, after: Duration) -> SharedTable<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: Table<K, V> + 'static,
{
    Arc::new(Timed::new(Arc::new(inner), after))
}
