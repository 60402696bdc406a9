//! Fault injection for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;

use super::{CacheStore, KeyRange, MemoryCache, MemoryTable, StoreError, Table, UpdateFn, Updated};

type KeyPredicate<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

fn injected(op: &str) -> StoreError {
    StoreError::Backend(format!("injected {} failure", op))
}

/// A memory table whose operations can be made to fail.
pub struct FaultyTable<K, V> {
    inner: MemoryTable<K, V>,
    fail_all: AtomicBool,
    fail_gets: Mutex<Option<KeyPredicate<K>>>,
    fail_puts: Mutex<Option<KeyPredicate<K>>>,
    fail_updates: Mutex<Option<KeyPredicate<K>>>,
    fail_deletes: AtomicBool,
    fail_scans: AtomicBool,
    /// Remaining puts that fail before puts succeed again.
    failing_puts_left: AtomicUsize,
}

impl<K: Ord, V> FaultyTable<K, V> {
    /// A table that behaves normally until told otherwise.
    pub fn new() -> Self {
        Self {
            inner: MemoryTable::new(),
            fail_all: AtomicBool::new(false),
            fail_gets: Mutex::new(None),
            fail_puts: Mutex::new(None),
            fail_updates: Mutex::new(None),
            fail_deletes: AtomicBool::new(false),
            fail_scans: AtomicBool::new(false),
            failing_puts_left: AtomicUsize::new(0),
        }
    }

    /// Fail every operation.
    pub fn fail_all(&self, on: bool) {
        self.fail_all.store(on, Ordering::SeqCst);
    }

    /// Fail point lookups whose key matches.
    pub fn fail_gets_where(&self, pred: impl Fn(&K) -> bool + Send + Sync + 'static) {
        *self.fail_gets.lock().unwrap() = Some(Arc::new(pred));
    }

    /// Fail puts whose key matches.
    pub fn fail_puts_where(&self, pred: impl Fn(&K) -> bool + Send + Sync + 'static) {
        *self.fail_puts.lock().unwrap() = Some(Arc::new(pred));
    }

    /// Fail the next `n` puts, whatever the key.
    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts_left.store(n, Ordering::SeqCst);
    }

    /// Fail updates whose key matches.
    pub fn fail_updates_where(&self, pred: impl Fn(&K) -> bool + Send + Sync + 'static) {
        *self.fail_updates.lock().unwrap() = Some(Arc::new(pred));
    }

    /// Fail every delete.
    pub fn fail_deletes(&self, on: bool) {
        self.fail_deletes.store(on, Ordering::SeqCst);
    }

    /// Fail every range scan.
    pub fn fail_scans(&self, on: bool) {
        self.fail_scans.store(on, Ordering::SeqCst);
    }

    /// Restore normal behavior.
    pub fn heal(&self) {
        self.fail_all(false);
        self.fail_deletes(false);
        self.fail_scans(false);
        self.failing_puts_left.store(0, Ordering::SeqCst);
        *self.fail_gets.lock().unwrap() = None;
        *self.fail_puts.lock().unwrap() = None;
        *self.fail_updates.lock().unwrap() = None;
    }

    fn matches(slot: &Mutex<Option<KeyPredicate<K>>>, key: &K) -> bool {
        slot.lock().unwrap().as_ref().map(|p| p(key)).unwrap_or(false)
    }
}

#[async_trait]
impl<K, V> Table<K, V> for FaultyTable<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Result<Option<V>, StoreError> {
        if self.fail_all.load(Ordering::SeqCst) || Self::matches(&self.fail_gets, key) {
            return Err(injected("get"));
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: K, value: V) -> Result<(), StoreError> {
        if self.fail_all.load(Ordering::SeqCst) || Self::matches(&self.fail_puts, &key) {
            return Err(injected("put"));
        }
        let drained = self
            .failing_puts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if drained {
            return Err(injected("put"));
        }
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &K) -> Result<(), StoreError> {
        if self.fail_all.load(Ordering::SeqCst) || self.fail_deletes.load(Ordering::SeqCst) {
            return Err(injected("delete"));
        }
        self.inner.delete(key).await
    }

    async fn scan(&self, range: KeyRange<K>, limit: usize) -> Result<Vec<(K, V)>, StoreError> {
        if self.fail_all.load(Ordering::SeqCst) || self.fail_scans.load(Ordering::SeqCst) {
            return Err(injected("scan"));
        }
        self.inner.scan(range, limit).await
    }

    async fn update(&self, key: &K, decide: UpdateFn<V>) -> Result<Updated<V>, StoreError> {
        if self.fail_all.load(Ordering::SeqCst) || Self::matches(&self.fail_updates, key) {
            return Err(injected("update"));
        }
        self.inner.update(key, decide).await
    }
}

/// A memory cache whose operations can be made to fail.
#[derive(Default)]
pub struct FaultyCache {
    inner: MemoryCache,
    fail_sets: AtomicBool,
    fail_deletes: AtomicBool,
    fail_gets: AtomicBool,
}

impl FaultyCache {
    /// A cache that behaves normally until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every set.
    pub fn fail_sets(&self, on: bool) {
        self.fail_sets.store(on, Ordering::SeqCst);
    }

    /// Fail every delete.
    pub fn fail_deletes(&self, on: bool) {
        self.fail_deletes.store(on, Ordering::SeqCst);
    }

    /// Fail every get.
    pub fn fail_gets(&self, on: bool) {
        self.fail_gets.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStore for FaultyCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(injected("cache set"));
        }
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(injected("cache get"));
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(injected("cache delete"));
        }
        self.inner.delete(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.expire(key, ttl).await
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.inner.purge_expired().await
    }
}
