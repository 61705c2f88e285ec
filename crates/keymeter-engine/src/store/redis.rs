//! Redis storage backend
//!
//! Layout under a configurable prefix:
//! - `<prefix>:key:<id>` hash, field `data` holds the JSON key
//! - `<prefix>:keys:list` set of key ids
//! - `<prefix>:key:<id>:usage` JSON usage record with a TTL

use async_trait::async_trait;
use keymeter_common::{BatchDeleteResult, Key, KeymeterError, Result, UsageRecord};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::{sort_keys, KeyStore, UsageCache};

/// Default key prefix
pub const DEFAULT_PREFIX: &str = "keymeter";

/// Redis-backed key store and usage cache
pub struct RedisStorage {
    client: Client,
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
    prefix: String,
}

fn storage_err(context: &str, e: redis::RedisError) -> KeymeterError {
    KeymeterError::Storage(format!("{}: {}", context, e))
}

impl RedisStorage {
    /// Connect to Redis
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| KeymeterError::Config(format!("Failed to create Redis client: {}", e)))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| storage_err("Failed to connect to Redis", e))?;

        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(Some(connection))),
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    /// Use a custom key prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    fn key_entry(&self, id: &str) -> String {
        format!("{}:key:{}", self.prefix, id)
    }

    fn key_list(&self) -> String {
        format!("{}:keys:list", self.prefix)
    }

    fn usage_entry(&self, id: &str) -> String {
        format!("{}:key:{}:usage", self.prefix, id)
    }

    async fn get_connection(&self) -> Result<MultiplexedConnection> {
        let guard = self.connection.read().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        drop(guard);

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| storage_err("Failed to reconnect to Redis", e))?;

        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Forget the cached connection after a failure so the next call reconnects
    async fn reset_connection(&self, e: &redis::RedisError) {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            warn!("Redis connection lost: {}", e);
            *self.connection.write().await = None;
        }
    }

    async fn check<T>(
        &self,
        context: &str,
        result: std::result::Result<T, redis::RedisError>,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.reset_connection(&e).await;
                Err(storage_err(context, e))
            }
        }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl KeyStore for RedisStorage {
    #[instrument(skip(self))]
    async fn list_all(&self) -> Result<Vec<Key>> {
        let mut conn = self.get_connection().await?;

        let ids: Vec<String> = self
            .check("Redis SMEMBERS failed", conn.smembers(self.key_list()).await)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hget(self.key_entry(id), "data");
        }
        let rows: Vec<Option<String>> = self
            .check("Redis HGET pipeline failed", pipe.query_async(&mut conn).await)
            .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for (id, row) in ids.iter().zip(rows) {
            let Some(json) = row else {
                debug!(key_id = %id, "Listed id has no key entry");
                continue;
            };
            match serde_json::from_str::<Key>(&json) {
                Ok(key) => keys.push(key),
                Err(e) => warn!(key_id = %id, "Skipping undecodable key: {}", e),
            }
        }

        sort_keys(&mut keys);
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> Result<Option<Key>> {
        let mut conn = self.get_connection().await?;
        let data: Option<String> = self
            .check("Redis HGET failed", conn.hget(self.key_entry(id), "data").await)
            .await?;

        data.map(|json| serde_json::from_str(&json).map_err(KeymeterError::from))
            .transpose()
    }

    #[instrument(skip(self, key), fields(key_id = %key.id))]
    async fn save(&self, key: &Key) -> Result<()> {
        let json = serde_json::to_string(key)?;
        let mut conn = self.get_connection().await?;

        let result: std::result::Result<(), _> = redis::pipe()
            .atomic()
            .hset(self.key_entry(&key.id), "data", json)
            .ignore()
            .sadd(self.key_list(), &key.id)
            .ignore()
            .query_async(&mut conn)
            .await;

        self.check("Redis save failed", result).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;

        let (removed,): (i64,) = self
            .check(
                "Redis delete failed",
                redis::pipe()
                    .atomic()
                    .del(self.key_entry(id))
                    .del(self.usage_entry(id))
                    .ignore()
                    .srem(self.key_list(), id)
                    .ignore()
                    .query_async(&mut conn)
                    .await,
            )
            .await?;

        Ok(removed > 0)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn batch_delete(&self, ids: &[String]) -> Result<BatchDeleteResult> {
        if ids.is_empty() {
            return Ok(BatchDeleteResult::default());
        }

        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.del(self.key_entry(id))
                .del(self.usage_entry(id))
                .ignore()
                .srem(self.key_list(), id)
                .ignore();
        }

        let removed: Vec<i64> = match pipe.query_async(&mut conn).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!("Batch delete pipeline failed: {}", e);
                self.reset_connection(&e).await;
                return Ok(BatchDeleteResult {
                    success: 0,
                    failed: ids.len(),
                });
            }
        };

        let absent = removed.iter().filter(|&&n| n == 0).count();
        if absent > 0 {
            debug!(absent, "Batch delete included ids that were not stored");
        }
        Ok(BatchDeleteResult {
            success: ids.len(),
            failed: 0,
        })
    }
}

#[async_trait]
impl UsageCache for RedisStorage {
    #[instrument(skip(self))]
    async fn get_usage(&self, id: &str) -> Result<Option<UsageRecord>> {
        let mut conn = self.get_connection().await?;
        let data: Option<String> = self
            .check("Redis GET failed", conn.get(self.usage_entry(id)).await)
            .await?;

        data.map(|json| serde_json::from_str(&json).map_err(KeymeterError::from))
            .transpose()
    }

    #[instrument(skip(self, record), fields(key_id = %record.id))]
    async fn set_usage(&self, record: &UsageRecord, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(record)?;
        let mut conn = self.get_connection().await?;

        let result = conn
            .set_ex::<_, _, ()>(self.usage_entry(&record.id), json, ttl_secs(ttl))
            .await;
        self.check("Redis SETEX failed", result).await
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn batch_set_usage(&self, records: &[UsageRecord], ttl: Duration) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for record in records {
            match serde_json::to_string(record) {
                Ok(json) => {
                    pipe.set_ex(self.usage_entry(&record.id), json, ttl_secs(ttl))
                        .ignore();
                }
                Err(e) => warn!(key_id = %record.id, "Skipping unencodable usage: {}", e),
            }
        }

        let mut conn = self.get_connection().await?;
        let result: std::result::Result<(), _> = pipe.query_async(&mut conn).await;
        self.check("Redis SETEX pipeline failed", result).await?;

        debug!(count = records.len(), ttl_secs = ttl_secs(ttl), "Cached usage records");
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn remove_usage(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let entries: Vec<String> = ids.iter().map(|id| self.usage_entry(id)).collect();
        let mut conn = self.get_connection().await?;
        let result = conn.del::<_, ()>(entries).await;
        self.check("Redis DEL failed", result).await
    }
}
