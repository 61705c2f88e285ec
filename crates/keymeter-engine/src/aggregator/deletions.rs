//! Deletion epochs
//!
//! Every delete bumps a global epoch and stamps the deleted ids with it.
//! A report remembers the epoch it started at and must not cache a record
//! whose key was stamped later. Stamps are pruned once no report that
//! started before them is still running.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub struct DeletionLog {
    epoch: AtomicU64,
    stamps: DashMap<String, u64>,
    /// Start epoch -> number of reports still running from it
    active: Mutex<BTreeMap<u64, usize>>,
}

impl DeletionLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a report starting now
    pub fn begin(self: &Arc<Self>) -> ReportTicket {
        let mut active = self.active.lock();
        let epoch = self.epoch.load(Ordering::Acquire);
        *active.entry(epoch).or_insert(0) += 1;
        ReportTicket {
            epoch,
            log: self.clone(),
        }
    }

    /// Stamp `key_ids` as deleted
    pub fn record<'a>(&self, key_ids: impl IntoIterator<Item = &'a str>) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        for key_id in key_ids {
            self.stamps.insert(key_id.to_string(), epoch);
        }
    }

    fn deleted_after(&self, key_id: &str, epoch: u64) -> bool {
        self.stamps
            .get(key_id)
            .map(|stamp| *stamp > epoch)
            .unwrap_or(false)
    }

    fn release(&self, epoch: u64) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                active.remove(&epoch);
            }
        }

        match active.keys().next().copied() {
            Some(oldest) => self.stamps.retain(|_, stamp| *stamp > oldest),
            None => self.stamps.clear(),
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.stamps.len()
    }
}

/// A running report's view of deletions; releases its slot on drop
pub struct ReportTicket {
    epoch: u64,
    log: Arc<DeletionLog>,
}

impl ReportTicket {
    /// Whether `key_id` was deleted after this report started
    pub fn is_deleted(&self, key_id: &str) -> bool {
        self.log.deleted_after(key_id, self.epoch)
    }
}

impl Drop for ReportTicket {
    fn drop(&mut self) {
        self.log.release(self.epoch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_later_deletions_are_visible() {
        let log = DeletionLog::new();
        log.record(["before"]);

        let ticket = log.begin();
        assert!(!ticket.is_deleted("before"));
        assert!(!ticket.is_deleted("other"));

        log.record(["during"]);
        assert!(ticket.is_deleted("during"));

        let later = log.begin();
        assert!(!later.is_deleted("during"));
    }

    #[test]
    fn test_stamps_pruned_when_reports_finish() {
        let log = DeletionLog::new();
        let first = log.begin();
        log.record(["a"]);
        let second = log.begin();
        log.record(["b"]);
        assert_eq!(log.pending(), 2);

        drop(first);
        // `second` still needs the later stamp only
        assert_eq!(log.pending(), 1);
        assert!(second.is_deleted("b"));
        assert!(!second.is_deleted("a"));

        drop(second);
        assert_eq!(log.pending(), 0);
    }
}
