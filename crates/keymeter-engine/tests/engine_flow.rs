//! End-to-end flows through service, aggregator, coordinator and pool
//! with an in-process fetcher and in-memory storage.

use async_trait::async_trait;
use keymeter_common::{Key, KeymeterError, Result, UsageRecord};
use keymeter_engine::{
    BatchCoordinator, CoordinatorConfig, KeyStore, KeymeterConfig, MemoryStorage, PoolConfig,
    PoolState, Task, UsageFetcher, UsageService, WorkerPool,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Answers every lookup after a small key-dependent delay and counts calls.
/// Credentials starting with `bad-` come back as an HTTP 403 record.
struct CountingFetcher {
    calls: AtomicUsize,
    allowance: Mutex<f64>,
}

impl CountingFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            allowance: Mutex::new(1000.0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UsageFetcher for CountingFetcher {
    async fn fetch_usage(&self, key_id: &str, credential: &str) -> Result<UsageRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let jitter = credential.bytes().map(u64::from).sum::<u64>() % 15;
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        if credential.starts_with("bad-") {
            return Ok(UsageRecord::failed(key_id, "HTTP 403"));
        }
        let allowance = *self.allowance.lock();
        Ok(UsageRecord::new(key_id, "2024-01-01", "2024-02-01", allowance, 250.0, 0.25))
    }
}

/// Holds the first lookup until released; later lookups answer at once
struct GatedFetcher {
    calls: AtomicUsize,
    allowance: Mutex<f64>,
    entered: Notify,
    release: Notify,
}

impl GatedFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            allowance: Mutex::new(1000.0),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl UsageFetcher for GatedFetcher {
    async fn fetch_usage(&self, key_id: &str, _credential: &str) -> Result<UsageRecord> {
        // Read the value before blocking so the held lookup answers with it
        let allowance = *self.allowance.lock();
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(UsageRecord::new(key_id, "2024-01-01", "2024-02-01", allowance, 100.0, 0.1))
    }
}

fn test_config() -> KeymeterConfig {
    let mut config = KeymeterConfig::default();
    config.pool = PoolConfig {
        max_workers: 8,
        queue_size: 256,
        submit_timeout_ms: 100,
    };
    config
}

fn started_service(fetcher: Arc<CountingFetcher>) -> (UsageService, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let service = UsageService::assemble(storage.clone(), fetcher, &test_config());
    service.start().unwrap();
    (service, storage)
}

fn credentials(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}-credential-{:04}", prefix, i)).collect()
}

#[tokio::test]
async fn report_has_one_record_per_key_in_listing_order() {
    let fetcher = CountingFetcher::new();
    let (service, _) = started_service(fetcher.clone());
    service.import_keys(&credentials("fk", 60)).await.unwrap();

    let listed = service.list_keys_masked().await.unwrap();
    let report = service.aggregated_report().await.unwrap();

    assert_eq!(report.total_count, 60);
    assert_eq!(report.data.len(), listed.len());
    for (record, key) in report.data.iter().zip(&listed) {
        assert_eq!(record.id, key.id);
    }
    assert_eq!(fetcher.calls(), 60);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn fresh_cache_entries_are_not_refetched() {
    let fetcher = CountingFetcher::new();
    let (service, _) = started_service(fetcher.clone());
    service.import_keys(&credentials("fk", 10)).await.unwrap();

    service.aggregated_report().await.unwrap();
    assert_eq!(fetcher.calls(), 10);

    let second = service.aggregated_report().await.unwrap();
    assert_eq!(fetcher.calls(), 10);
    assert_eq!(second.total_count, 10);
    assert!(second.data.iter().all(|r| r.is_ok()));

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn totals_skip_records_with_errors() {
    let fetcher = CountingFetcher::new();
    let (service, storage) = started_service(fetcher.clone());

    let mut creds = credentials("fk", 3);
    creds.extend(credentials("bad", 2));
    service.import_keys(&creds).await.unwrap();

    let report = service.aggregated_report().await.unwrap();
    assert_eq!(report.total_count, 5);
    assert_eq!(report.healthy().count(), 3);
    assert_eq!(report.totals.total_allowance, 3000.0);
    assert_eq!(report.totals.total_org_total_tokens_used, 750.0);

    // Failed lookups are not cached, so they are retried next time
    let failed: Vec<&UsageRecord> = report.data.iter().filter(|r| !r.is_ok()).collect();
    assert_eq!(failed.len(), 2);
    for record in failed {
        assert_eq!(record.error.as_deref(), Some("HTTP 403"));
        assert!(!storage.has_usage(&record.id));
    }

    service.aggregated_report().await.unwrap();
    assert_eq!(fetcher.calls(), 7);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn import_counts_in_batch_duplicates() {
    let (service, _) = started_service(CountingFetcher::new());

    let result = service
        .import_keys(&["A".to_string(), "A".to_string(), "B".to_string()])
        .await
        .unwrap();

    assert_eq!(result.success, 2);
    assert_eq!(result.duplicates, 1);
    assert_eq!(result.failed, 0);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn full_queue_yields_placeholders_without_waiting_for_deadline() {
    let pool = Arc::new(WorkerPool::new(
        PoolConfig {
            max_workers: 2,
            queue_size: 4,
            submit_timeout_ms: 100,
        },
        CountingFetcher::new(),
    ));

    let filler = Key::new("filler-credential");
    for _ in 0..4 {
        pool.try_submit(Task::new(0, &filler)).unwrap();
    }
    assert!(matches!(
        pool.try_submit(Task::new(0, &filler)),
        Err(KeymeterError::QueueFull)
    ));

    let coordinator = BatchCoordinator::new(pool.clone(), CoordinatorConfig::default());
    let keys: Vec<Key> = credentials("fk", 12).into_iter().map(Key::new).collect();

    let started = Instant::now();
    let records = coordinator.process_batch(&keys).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(records.len(), 12);
    for (record, key) in records.iter().zip(&keys) {
        assert_eq!(record.id, key.id);
        assert_eq!(record.error.as_deref(), Some("task queue full"));
    }
}

#[tokio::test]
async fn stop_terminates_with_tasks_still_queued() {
    let fetcher = CountingFetcher::new();
    let pool = WorkerPool::new(
        PoolConfig {
            max_workers: 2,
            queue_size: 500,
            submit_timeout_ms: 100,
        },
        fetcher.clone(),
    );
    for key in credentials("fk", 400).into_iter().map(Key::new) {
        pool.try_submit(Task::new(1, &key)).unwrap();
    }

    pool.start().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(5), pool.stop())
        .await
        .expect("pool stop hung")
        .unwrap();

    let stats = pool.stats();
    assert_eq!(stats.state, PoolState::Stopped);
    assert_eq!(stats.active_workers, 0);
    assert!(fetcher.calls() < 400);

    // Stop is valid once
    assert!(pool.stop().await.is_err());
}

#[tokio::test]
async fn deleted_key_never_serves_pre_deletion_usage() {
    let fetcher = CountingFetcher::new();
    let (service, storage) = started_service(fetcher.clone());

    let key = Key {
        id: "key-fixed0001-1700000000".to_string(),
        key: "fk-stable-credential".to_string(),
        name: "fixed".to_string(),
        created_at: chrono::Utc::now(),
    };
    storage.save(&key).await.unwrap();

    let before = service.aggregated_report().await.unwrap();
    assert_eq!(before.data[0].total_allowance, 1000.0);

    service.delete_key(&key.id).await.unwrap();
    *fetcher.allowance.lock() = 5000.0;
    storage.save(&key).await.unwrap();

    let after = service.aggregated_report().await.unwrap();
    assert_eq!(after.data[0].id, key.id);
    assert_eq!(after.data[0].total_allowance, 5000.0);
    assert_eq!(fetcher.calls(), 2);

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn batch_delete_treats_missing_ids_as_deleted() {
    let (service, _) = started_service(CountingFetcher::new());
    service.import_keys(&credentials("fk", 3)).await.unwrap();

    let mut ids: Vec<String> = service
        .list_keys_masked()
        .await
        .unwrap()
        .into_iter()
        .map(|k| k.id)
        .collect();
    ids.push("key-doesnotexist-0".to_string());

    let result = service.batch_delete_keys(&ids).await.unwrap();
    assert_eq!(result.success, 4);
    assert_eq!(result.failed, 0);

    let remaining: HashSet<String> = service
        .list_keys_masked()
        .await
        .unwrap()
        .into_iter()
        .map(|k| k.id)
        .collect();
    assert!(remaining.is_empty());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn key_deleted_during_report_is_not_cached_by_it() {
    let fetcher = GatedFetcher::new();
    let storage = Arc::new(MemoryStorage::new());
    let service = Arc::new(UsageService::assemble(
        storage.clone(),
        fetcher.clone(),
        &test_config(),
    ));
    service.start().unwrap();

    let key = Key {
        id: "key-racing01-1700000000".to_string(),
        key: "fk-racing-credential".to_string(),
        name: "racing".to_string(),
        created_at: chrono::Utc::now(),
    };
    storage.save(&key).await.unwrap();

    let running = tokio::spawn({
        let service = service.clone();
        async move { service.aggregated_report().await }
    });

    // The lookup is in flight when the key goes away
    fetcher.entered.notified().await;
    service.delete_key(&key.id).await.unwrap();
    *fetcher.allowance.lock() = 5000.0;
    fetcher.release.notify_one();

    let first = running.await.unwrap().unwrap();
    assert_eq!(first.data[0].total_allowance, 1000.0);
    assert!(!storage.has_usage(&key.id));

    storage.save(&key).await.unwrap();
    let after = service.aggregated_report().await.unwrap();
    assert_eq!(after.data[0].id, key.id);
    assert_eq!(after.data[0].total_allowance, 5000.0);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

    service.shutdown().await.unwrap();
}
