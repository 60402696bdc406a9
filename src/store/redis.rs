//! Redis cache tier.
//!
//! Implements [`CacheStore`] over a multiplexed `ConnectionManager`, which
//! reconnects on its own after transient failures. Keys are namespaced with
//! a configurable prefix.

use std::time::Duration;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use tracing::{debug, info};

use super::{CacheStore, StoreError};

/// Redis-backed cache.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisCache {
    /// Connect to `url`, namespacing every key under `prefix`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        let conn = ConnectionManager::new(client).await.map_err(map_redis_error)?;
        info!("Connected cache tier to redis");
        Ok(Self { conn, prefix: prefix.into() })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

fn map_redis_error(err: RedisError) -> StoreError {
    StoreError::Backend(format!("redis: {}", err))
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        let _: () = conn
            .pset_ex(&key, value, millis(ttl) as _)
            .await
            .map_err(map_redis_error)?;
        debug!("cache set {} ttl {:?}", key, ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(self.key(key)).await.map_err(map_redis_error)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(self.key(key)).await.map_err(map_redis_error)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.pexpire(self.key(key), millis(ttl) as _)
            .await
            .map_err(map_redis_error)
    }
}
