//! In-process fast-path cache of usage records

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keymeter_common::UsageRecord;
use std::time::Duration;

/// Bounded `DashMap` of recent, error-free usage records keyed by key id
pub struct LocalUsageCache {
    entries: DashMap<String, UsageRecord>,
    max_entries: usize,
    freshness: Duration,
}

impl LocalUsageCache {
    pub fn new(max_entries: usize, freshness: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            freshness,
        }
    }

    /// Cached record for `key_id` if it is still fresh at `now`
    pub fn get_fresh(&self, key_id: &str, now: DateTime<Utc>) -> Option<UsageRecord> {
        self.entries
            .get(key_id)
            .filter(|entry| entry.is_fresh(now, self.freshness))
            .map(|entry| entry.value().clone())
    }

    /// Remember an error-free record; records with an error are ignored
    pub fn insert(&self, record: UsageRecord) {
        if self.max_entries == 0 || !record.is_ok() {
            return;
        }

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&record.id) {
            let now = Utc::now();
            self.entries
                .retain(|_, cached| cached.is_fresh(now, self.freshness));

            // Still full: drop the oldest snapshot
            if self.entries.len() >= self.max_entries {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|entry| entry.last_updated)
                    .map(|entry| entry.key().clone());
                if let Some(oldest) = oldest {
                    self.entries.remove(&oldest);
                }
            }
        }

        self.entries.insert(record.id.clone(), record);
    }

    pub fn invalidate(&self, key_id: &str) {
        self.entries.remove(key_id);
    }

    pub fn invalidate_many<'a>(&self, key_ids: impl IntoIterator<Item = &'a str>) {
        for key_id in key_ids {
            self.entries.remove(key_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
