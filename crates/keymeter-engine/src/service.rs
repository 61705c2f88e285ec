//! Key management and reporting service
//!
//! The operations exposed to callers such as the HTTP layer.

use keymeter_common::{
    AggregatedReport, BatchDeleteResult, ImportResult, Key, KeymeterError, MaskedKey, Result,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::aggregator::UsageAggregator;
use crate::config::KeymeterConfig;
use crate::coordinator::BatchCoordinator;
use crate::fetcher::{HttpUsageFetcher, UsageFetcher};
use crate::pool::{PoolStats, WorkerPool};
use crate::store::{KeyStore, MemoryStorage, RedisStorage, UsageCache};

/// Owns the key store, the worker pool and the aggregator
pub struct UsageService {
    keys: Arc<dyn KeyStore>,
    aggregator: UsageAggregator,
    pool: Arc<WorkerPool>,
}

impl UsageService {
    pub fn new(
        keys: Arc<dyn KeyStore>,
        aggregator: UsageAggregator,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            keys,
            aggregator,
            pool,
        }
    }

    /// Wire every component from configuration. The pool is created but
    /// not started.
    pub async fn from_config(config: &KeymeterConfig) -> Result<Self> {
        let fetcher: Arc<dyn UsageFetcher> = Arc::new(HttpUsageFetcher::new(&config.fetcher)?);

        if config.redis.is_enabled() {
            let storage = RedisStorage::new(&config.redis.url)
                .await?
                .with_prefix(&config.redis.prefix);
            info!(prefix = %config.redis.prefix, "Using Redis storage");
            Ok(Self::assemble(Arc::new(storage), fetcher, config))
        } else {
            warn!("No Redis URL configured, keys are kept in memory only");
            Ok(Self::assemble(Arc::new(MemoryStorage::new()), fetcher, config))
        }
    }

    /// Build the pipeline over one storage backend serving both roles
    pub fn assemble<S>(
        storage: Arc<S>,
        fetcher: Arc<dyn UsageFetcher>,
        config: &KeymeterConfig,
    ) -> Self
    where
        S: KeyStore + UsageCache + 'static,
    {
        let pool = Arc::new(WorkerPool::new(config.pool.clone(), fetcher));
        let coordinator = Arc::new(BatchCoordinator::new(
            pool.clone(),
            config.coordinator.clone(),
        ));
        let cache: Arc<dyn UsageCache> = storage.clone();
        let aggregator = UsageAggregator::new(coordinator, cache, config.cache.clone());
        Self::new(storage, aggregator, pool)
    }

    /// Launch the worker pool
    pub fn start(&self) -> Result<()> {
        self.pool.start()
    }

    /// Stop the worker pool; valid once, after `start`
    pub async fn shutdown(&self) -> Result<()> {
        self.pool.stop().await
    }

    /// Import raw credentials.
    ///
    /// Entries are trimmed and blanks skipped without being counted.
    /// Credentials already stored, or seen earlier in the same call, count
    /// as duplicates.
    #[instrument(skip(self, credentials), fields(count = credentials.len()))]
    pub async fn import_keys(&self, credentials: &[String]) -> Result<ImportResult> {
        let existing = self.keys.list_all().await?;
        let mut known: HashSet<String> = existing.into_iter().map(|k| k.key).collect();
        let mut result = ImportResult::default();

        for raw in credentials {
            let credential = raw.trim();
            if credential.is_empty() {
                continue;
            }
            if known.contains(credential) {
                result.duplicates += 1;
                continue;
            }

            let key = Key::new(credential);
            match self.keys.save(&key).await {
                Ok(()) => {
                    result.success += 1;
                    known.insert(credential.to_string());
                }
                Err(e) => {
                    warn!(key_id = %key.id, "Failed to save key: {}", e);
                    result.failed += 1;
                }
            }
        }

        info!(
            success = result.success,
            failed = result.failed,
            duplicates = result.duplicates,
            "Imported keys"
        );
        Ok(result)
    }

    /// Add one credential with an optional display name
    #[instrument(skip(self, credential))]
    pub async fn add_key(&self, credential: &str, name: Option<&str>) -> Result<Key> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(KeymeterError::Validation("key must not be empty".into()));
        }

        let existing = self.keys.list_all().await?;
        if existing.iter().any(|k| k.key == credential) {
            return Err(KeymeterError::DuplicateKey);
        }

        let mut key = Key::new(credential);
        if let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) {
            key = key.with_name(name);
        }
        self.keys.save(&key).await?;
        info!(key_id = %key.id, "Added key");
        Ok(key)
    }

    /// Every key with its credential masked
    pub async fn list_keys_masked(&self) -> Result<Vec<MaskedKey>> {
        Ok(self
            .keys
            .list_all()
            .await?
            .iter()
            .map(Key::masked)
            .collect())
    }

    /// The key with its full credential
    pub async fn get_full_key(&self, id: &str) -> Result<Key> {
        self.keys
            .get(id)
            .await?
            .ok_or_else(|| KeymeterError::NotFound(id.to_string()))
    }

    /// Delete a key and everything cached for it.
    ///
    /// Deleting an id that does not exist succeeds; only a store failure
    /// is an error.
    #[instrument(skip(self))]
    pub async fn delete_key(&self, id: &str) -> Result<()> {
        self.aggregator.forget([id]);
        let existed = self.keys.delete(id).await?;
        self.aggregator.invalidate([id]);

        if existed {
            info!(key_id = %id, "Deleted key");
        } else {
            debug!(key_id = %id, "Deleted key was not stored");
        }
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn batch_delete_keys(&self, ids: &[String]) -> Result<BatchDeleteResult> {
        self.aggregator.forget(ids.iter().map(String::as_str));
        let result = self.keys.batch_delete(ids).await?;
        self.aggregator.invalidate(ids.iter().map(String::as_str));
        info!(
            success = result.success,
            failed = result.failed,
            "Batch deleted keys"
        );
        Ok(result)
    }

    /// Cache-aware fetch-and-aggregate over every stored key
    #[instrument(skip(self))]
    pub async fn aggregated_report(&self) -> Result<AggregatedReport> {
        let ticket = self.aggregator.begin_report();
        let keys = self.keys.list_all().await.map_err(|e| match e {
            KeymeterError::Storage(_) => e,
            other => KeymeterError::Storage(other.to_string()),
        })?;

        Ok(self.aggregator.aggregate_with(ticket, &keys).await)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}
