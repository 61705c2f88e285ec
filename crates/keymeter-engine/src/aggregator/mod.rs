//! Cache-Aware Aggregator
//!
//! Partitions keys into fresh (served from cache) and stale (fetched through
//! the batch coordinator), writes error-free fetches back to the persistent
//! cache, and assembles the report in input key order.
//!
//! Cache lookups go through two tiers: an in-process fast path, then the
//! persistent usage cache. Freshness is judged from each record's
//! `last_updated`; the persistent TTL only bounds how long entries linger.
//!
//! A key deleted while a report is running is never cached by that report.

mod deletions;
pub mod local_cache;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use keymeter_common::{AggregatedReport, Key, KeymeterError, UsageRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::coordinator::BatchCoordinator;
use crate::store::UsageCache;

use deletions::DeletionLog;
pub use deletions::ReportTicket;
pub use local_cache::LocalUsageCache;

/// Cache behaviour for aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// A cached record younger than this is served without a fetch
    pub freshness_window_secs: u64,
    /// TTL for records written to the persistent cache
    pub cache_ttl_secs: u64,
    /// Capacity of the in-process fast-path cache (0 disables it)
    pub local_cache_size: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: 300,
            cache_ttl_secs: 300,
            local_cache_size: 1000,
        }
    }
}

impl AggregatorConfig {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Builds aggregated reports, fetching only what the caches cannot answer
pub struct UsageAggregator {
    coordinator: Arc<BatchCoordinator>,
    cache: Arc<dyn UsageCache>,
    local: LocalUsageCache,
    deletions: Arc<DeletionLog>,
    config: AggregatorConfig,
}

impl UsageAggregator {
    pub fn new(
        coordinator: Arc<BatchCoordinator>,
        cache: Arc<dyn UsageCache>,
        config: AggregatorConfig,
    ) -> Self {
        let local = LocalUsageCache::new(config.local_cache_size, config.freshness_window());
        Self {
            coordinator,
            cache,
            local,
            deletions: DeletionLog::new(),
            config,
        }
    }

    pub fn local_cache(&self) -> &LocalUsageCache {
        &self.local
    }

    /// Mark keys as deleted so running reports stop caching them
    pub fn forget<'a>(&self, key_ids: impl IntoIterator<Item = &'a str> + Clone) {
        self.deletions.record(key_ids.clone());
        self.local.invalidate_many(key_ids);
    }

    /// Drop fast-path entries for deleted keys
    pub fn invalidate<'a>(&self, key_ids: impl IntoIterator<Item = &'a str>) {
        self.local.invalidate_many(key_ids);
    }

    /// Start tracking deletions for a report whose keys are about to be listed
    pub fn begin_report(&self) -> ReportTicket {
        self.deletions.begin()
    }

    /// Report over `keys`, one record per key in the same order
    pub async fn aggregate(&self, keys: &[Key]) -> AggregatedReport {
        self.aggregate_with(self.begin_report(), keys).await
    }

    /// Like `aggregate`, for keys listed after `ticket` was taken
    #[instrument(skip(self, ticket, keys), fields(keys = keys.len()))]
    pub async fn aggregate_with(&self, ticket: ReportTicket, keys: &[Key]) -> AggregatedReport {
        if keys.is_empty() {
            return AggregatedReport::empty();
        }

        let now = Utc::now();
        let lookups = join_all(keys.iter().map(|key| self.cached(&ticket, key, now))).await;

        let mut resolved: HashMap<String, UsageRecord> = HashMap::with_capacity(keys.len());
        let mut stale: Vec<Key> = Vec::new();
        for (key, cached) in keys.iter().zip(lookups) {
            match cached {
                Some(record) => {
                    resolved.insert(key.id.clone(), record);
                }
                None => stale.push(key.clone()),
            }
        }

        debug!(cached = resolved.len(), stale = stale.len(), "Partitioned keys");

        if !stale.is_empty() {
            let fetched = self.coordinator.process_batch(&stale).await;
            self.write_back(&ticket, &fetched).await;
            for (key, record) in stale.iter().zip(fetched) {
                resolved.insert(key.id.clone(), record);
            }
        }

        let data: Vec<UsageRecord> = keys
            .iter()
            .map(|key| {
                resolved.get(&key.id).cloned().unwrap_or_else(|| {
                    UsageRecord::failed(&key.id, KeymeterError::ProcessingTimeout.to_string())
                })
            })
            .collect();

        let with_balance = data
            .iter()
            .filter(|r| r.is_ok() && r.remaining > 0.0)
            .count();
        info!(
            total = data.len(),
            with_balance,
            fetched = stale.len(),
            "Aggregated usage report"
        );

        AggregatedReport::new(data)
    }

    /// Fresh record from the fast path or the persistent cache
    async fn cached(
        &self,
        ticket: &ReportTicket,
        key: &Key,
        now: DateTime<Utc>,
    ) -> Option<UsageRecord> {
        if let Some(record) = self.local.get_fresh(&key.id, now) {
            return Some(record);
        }

        match self.cache.get_usage(&key.id).await {
            Ok(Some(record))
                if record.is_ok() && record.is_fresh(now, self.config.freshness_window()) =>
            {
                self.remember(ticket, record.clone());
                Some(record)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(key_id = %key.id, "Usage cache read failed, refetching: {}", e);
                None
            }
        }
    }

    /// Persist error-free fetches of keys that still exist and remember
    /// them locally
    async fn write_back(&self, ticket: &ReportTicket, fetched: &[UsageRecord]) {
        let healthy: Vec<UsageRecord> = fetched
            .iter()
            .filter(|r| r.is_ok() && !ticket.is_deleted(&r.id))
            .cloned()
            .collect();
        if healthy.is_empty() {
            return;
        }

        if let Err(e) = self
            .cache
            .batch_set_usage(&healthy, self.config.cache_ttl())
            .await
        {
            warn!(count = healthy.len(), "Failed to cache usage records: {}", e);
        }

        // A delete may have landed while the write was in flight
        let deleted: Vec<String> = healthy
            .iter()
            .filter(|r| ticket.is_deleted(&r.id))
            .map(|r| r.id.clone())
            .collect();
        if !deleted.is_empty() {
            debug!(count = deleted.len(), "Dropping usage cached for deleted keys");
            if let Err(e) = self.cache.remove_usage(&deleted).await {
                warn!(count = deleted.len(), "Failed to drop usage of deleted keys: {}", e);
            }
        }

        for record in healthy {
            self.remember(ticket, record);
        }
    }

    fn remember(&self, ticket: &ReportTicket, record: UsageRecord) {
        if ticket.is_deleted(&record.id) {
            return;
        }
        let key_id = record.id.clone();
        self.local.insert(record);
        if ticket.is_deleted(&key_id) {
            self.local.invalidate(&key_id);
        }
    }
}
