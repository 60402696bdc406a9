//! In-memory store backends.
//!
//! Single-process implementations of [`Table`] and [`CacheStore`]. Used by
//! the default binary and by every test. Per-key atomicity of
//! [`Table::update`] comes from holding the write lock across the decision.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheStore, KeyRange, StoreError, Table, UpdateFn, Updated, Write};

/// Ordered in-memory table.
pub struct MemoryTable<K, V> {
    rows: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord, V> MemoryTable<K, V> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self { rows: RwLock::new(BTreeMap::new()) }
    }

    /// Number of rows.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Whether the table holds no rows.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

impl<K: Ord, V> Default for MemoryTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> Table<K, V> for MemoryTable<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn put(&self, key: K, value: V) -> Result<(), StoreError> {
        self.rows.write().await.insert(key, value);
        Ok(())
    }

    async fn delete(&self, key: &K) -> Result<(), StoreError> {
        self.rows.write().await.remove(key);
        Ok(())
    }

    async fn scan(&self, range: KeyRange<K>, limit: usize) -> Result<Vec<(K, V)>, StoreError> {
        if limit == 0 || range.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.rows.read().await;
        Ok(rows
            .range((range.start, range.end))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn update(&self, key: &K, decide: UpdateFn<V>) -> Result<Updated<V>, StoreError> {
        let mut rows = self.rows.write().await;
        let previous = rows.get(key).cloned();
        match decide(previous.as_ref()) {
            Write::Put(value) => {
                rows.insert(key.clone(), value.clone());
                Ok(Updated { previous, current: Some(value), applied: true })
            }
            Write::Delete => {
                rows.remove(key);
                Ok(Updated { previous, current: None, applied: true })
            }
            Write::Keep => Ok(Updated { current: previous.clone(), previous, applied: false }),
        }
    }
}

/// Entry stored in the cache with its deadline.
#[derive(Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory TTL cache.
///
/// Expired entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn live_len(&self) -> usize {
        self.entries.read().await.values().filter(|e| !e.is_expired()).count()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if ttl.is_zero() {
            entries.remove(key);
            return Ok(());
        }
        entries.insert(key.to_string(), CacheEntry { value, expires_at: Instant::now() + ttl });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        self.entries.write().await.remove(key);
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        Ok(before - entries.len())
    }
}
