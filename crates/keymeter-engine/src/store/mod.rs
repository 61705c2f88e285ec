//! Persistent key store and usage cache
//!
//! Two traits with two backends each: `RedisStorage` for production and
//! `MemoryStorage` for tests and Redis-less runs.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use keymeter_common::{BatchDeleteResult, Key, Result, UsageRecord};
use std::time::Duration;
use tracing::warn;

pub use self::memory::MemoryStorage;
pub use self::redis::RedisStorage;

/// Persistent store of metered keys
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Every stored key, ordered by `(created_at, id)`
    async fn list_all(&self) -> Result<Vec<Key>>;

    /// Look up one key
    async fn get(&self, id: &str) -> Result<Option<Key>>;

    /// Insert or overwrite a key
    async fn save(&self, key: &Key) -> Result<()>;

    /// Remove a key together with its cached usage; `false` when absent
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Remove many keys. Only deletes the store rejects count as failed;
    /// an absent id is already gone and counts as a success.
    async fn batch_delete(&self, ids: &[String]) -> Result<BatchDeleteResult> {
        let mut result = BatchDeleteResult::default();
        for id in ids {
            match self.delete(id).await {
                Ok(_) => result.success += 1,
                Err(e) => {
                    warn!(key_id = %id, "Delete failed: {}", e);
                    result.failed += 1;
                }
            }
        }
        Ok(result)
    }
}

/// TTL-bounded cache of the latest usage snapshot per key
#[async_trait]
pub trait UsageCache: Send + Sync {
    async fn get_usage(&self, id: &str) -> Result<Option<UsageRecord>>;

    async fn set_usage(&self, record: &UsageRecord, ttl: Duration) -> Result<()>;

    /// Write many records in one round trip
    async fn batch_set_usage(&self, records: &[UsageRecord], ttl: Duration) -> Result<()>;

    /// Drop cached usage for `ids`
    async fn remove_usage(&self, ids: &[String]) -> Result<()>;
}

/// Stable listing order for keys
pub(crate) fn sort_keys(keys: &mut [Key]) {
    keys.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
