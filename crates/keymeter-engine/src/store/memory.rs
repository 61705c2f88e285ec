//! In-memory storage backend
//!
//! Uses DashMap for concurrent access. Usage entries carry an expiry that
//! is checked on read.

use async_trait::async_trait;
use dashmap::DashMap;
use keymeter_common::{Key, Result, UsageRecord};
use std::time::{Duration, Instant};

use super::{sort_keys, KeyStore, UsageCache};

struct CachedUsage {
    record: UsageRecord,
    expires_at: Instant,
}

/// DashMap-backed key store and usage cache
#[derive(Default)]
pub struct MemoryStorage {
    keys: DashMap<String, Key>,
    usage: DashMap<String, CachedUsage>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Whether an unexpired usage entry exists for `id`
    pub fn has_usage(&self, id: &str) -> bool {
        self.usage
            .get(id)
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl KeyStore for MemoryStorage {
    async fn list_all(&self) -> Result<Vec<Key>> {
        let mut keys: Vec<Key> = self.keys.iter().map(|entry| entry.value().clone()).collect();
        sort_keys(&mut keys);
        Ok(keys)
    }

    async fn get(&self, id: &str) -> Result<Option<Key>> {
        Ok(self.keys.get(id).map(|entry| entry.value().clone()))
    }

    async fn save(&self, key: &Key) -> Result<()> {
        self.keys.insert(key.id.clone(), key.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.usage.remove(id);
        Ok(self.keys.remove(id).is_some())
    }
}

#[async_trait]
impl UsageCache for MemoryStorage {
    async fn get_usage(&self, id: &str) -> Result<Option<UsageRecord>> {
        let now = Instant::now();
        let hit = self
            .usage
            .get(id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.record.clone());

        if hit.is_none() {
            self.usage.remove_if(id, |_, entry| entry.expires_at <= now);
        }
        Ok(hit)
    }

    async fn set_usage(&self, record: &UsageRecord, ttl: Duration) -> Result<()> {
        self.usage.insert(
            record.id.clone(),
            CachedUsage {
                record: record.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn batch_set_usage(&self, records: &[UsageRecord], ttl: Duration) -> Result<()> {
        for record in records {
            self.set_usage(record, ttl).await?;
        }
        Ok(())
    }

    async fn remove_usage(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.usage.remove(id);
        }
        Ok(())
    }
}
