//! Batch Coordinator
//!
//! Submits one task per key, collects results until every key has answered
//! or the workload-proportional deadline passes, and returns one record per
//! key in input order. Keys that never answered get a `Processing timeout`
//! placeholder; keys that could not be queued get a `task queue full`
//! placeholder without ever reaching a worker.

pub mod deadline;
pub mod progress;

use keymeter_common::{Key, KeymeterError, UsageRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, instrument};

use crate::pool::{Task, TaskResult, WorkerPool};

pub use deadline::batch_deadline;
pub use progress::{ProgressEvent, ProgressObserver, TracingProgress};

/// Configuration for batch collection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Deadline floor
    pub base_timeout_ms: u64,
    /// Added per full round of work across all workers
    pub per_item_allowance_ms: u64,
    /// Deadline ceiling
    pub max_timeout_ms: u64,
    /// Pause before the single retry of a rejected submit
    pub retry_backoff_ms: u64,
    /// Progress tick period
    pub progress_interval_ms: u64,
    /// Emit a milestone every this many results (0 disables)
    pub milestone_every: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: 30_000,
            per_item_allowance_ms: 2_000,
            max_timeout_ms: 300_000,
            retry_backoff_ms: 10,
            progress_interval_ms: 1_000,
            milestone_every: 100,
        }
    }
}

impl CoordinatorConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

/// Fans a batch of keys out to the pool and assembles the answers
pub struct BatchCoordinator {
    pool: Arc<WorkerPool>,
    config: CoordinatorConfig,
    observer: Arc<dyn ProgressObserver>,
}

impl BatchCoordinator {
    pub fn new(pool: Arc<WorkerPool>, config: CoordinatorConfig) -> Self {
        Self::with_observer(pool, config, Arc::new(TracingProgress))
    }

    pub fn with_observer(
        pool: Arc<WorkerPool>,
        config: CoordinatorConfig,
        observer: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            pool,
            config,
            observer,
        }
    }

    /// Fetch every key through the pool. Never fails: per-key problems and
    /// the deadline both surface as placeholder records.
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub async fn process_batch(&self, keys: &[Key]) -> Vec<UsageRecord> {
        if keys.is_empty() {
            return Vec::new();
        }

        let expected = keys
            .iter()
            .map(|k| k.id.as_str())
            .collect::<HashSet<_>>()
            .len();

        // Only one batch drains the result queue at a time; the deadline
        // starts once this batch owns it.
        let results = self.pool.lock_results().await;
        let batch_id = self.pool.next_batch_id();
        let timeout = batch_deadline(keys.len(), self.pool.worker_count(), &self.config);

        self.observer.on_event(&ProgressEvent::Started {
            batch_id,
            total: expected,
            deadline: timeout,
        });

        let (rejected_tx, rejected_rx) = mpsc::channel(keys.len());
        let collector = Collector {
            batch_id,
            expected,
            deadline: Instant::now() + timeout,
            progress_interval: self.config.progress_interval(),
            milestone_every: self.config.milestone_every,
            observer: self.observer.clone(),
        };
        let collecting = tokio::spawn(collector.run(results, rejected_rx));

        for key in keys {
            if let Err(e) = self.dispatch(batch_id, key).await {
                debug!(key_id = %key.id, "Task not queued: {}", e);
                let placeholder = TaskResult {
                    batch_id,
                    key_id: key.id.clone(),
                    outcome: Err(e),
                };
                // Sized for the whole batch, never waits
                if rejected_tx.send(placeholder).await.is_err() {
                    break;
                }
            }
        }
        drop(rejected_tx);

        let collected = match collecting.await {
            Ok(collected) => collected,
            Err(e) => {
                error!(batch_id, "Result collector failed: {}", e);
                HashMap::new()
            }
        };

        keys.iter()
            .map(|key| {
                collected.get(&key.id).cloned().unwrap_or_else(|| {
                    UsageRecord::failed(&key.id, KeymeterError::ProcessingTimeout.to_string())
                })
            })
            .collect()
    }

    /// Non-blocking submit with one short retry
    async fn dispatch(&self, batch_id: u64, key: &Key) -> keymeter_common::Result<()> {
        match self.pool.try_submit(Task::new(batch_id, key)) {
            Err(KeymeterError::QueueFull) => {
                tokio::time::sleep(self.config.retry_backoff()).await;
                self.pool.try_submit(Task::new(batch_id, key))
            }
            other => other,
        }
    }
}

/// Per-batch result collector; exclusively owns the result map
struct Collector {
    batch_id: u64,
    expected: usize,
    deadline: Instant,
    progress_interval: Duration,
    milestone_every: usize,
    observer: Arc<dyn ProgressObserver>,
}

impl Collector {
    async fn run(
        self,
        mut results: OwnedMutexGuard<mpsc::Receiver<TaskResult>>,
        mut rejected: mpsc::Receiver<TaskResult>,
    ) -> HashMap<String, UsageRecord> {
        let started = Instant::now();
        let mut collected: HashMap<String, UsageRecord> = HashMap::with_capacity(self.expected);
        let mut ticker =
            tokio::time::interval_at(started + self.progress_interval, self.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let expiry = tokio::time::sleep_until(self.deadline);
        tokio::pin!(expiry);

        let mut pool_open = true;
        let mut rejected_open = true;

        while collected.len() < self.expected {
            if !pool_open && !rejected_open {
                break;
            }

            let received = tokio::select! {
                biased;
                _ = &mut expiry => {
                    self.observer.on_event(&ProgressEvent::TimedOut {
                        batch_id: self.batch_id,
                        received: collected.len(),
                        total: self.expected,
                        elapsed: started.elapsed(),
                    });
                    break;
                }
                next = rejected.recv(), if rejected_open => match next {
                    Some(result) => result,
                    None => {
                        rejected_open = false;
                        continue;
                    }
                },
                next = results.recv(), if pool_open => match next {
                    Some(result) => result,
                    None => {
                        debug!(batch_id = self.batch_id, "Result queue closed");
                        pool_open = false;
                        continue;
                    }
                },
                _ = ticker.tick() => {
                    self.observer.on_event(&ProgressEvent::Tick {
                        batch_id: self.batch_id,
                        received: collected.len(),
                        total: self.expected,
                        elapsed: started.elapsed(),
                    });
                    continue;
                }
            };

            if received.batch_id != self.batch_id {
                debug!(
                    batch_id = self.batch_id,
                    stale_batch = received.batch_id,
                    key_id = %received.key_id,
                    "Discarding late result"
                );
                continue;
            }

            let key_id = received.key_id.clone();
            if collected.insert(key_id, received.into_record()).is_none() {
                let count = collected.len();
                if self.milestone_every > 0 && count % self.milestone_every == 0 {
                    self.observer.on_event(&ProgressEvent::Milestone {
                        batch_id: self.batch_id,
                        received: count,
                        total: self.expected,
                        elapsed: started.elapsed(),
                    });
                }
            }
        }

        if collected.len() >= self.expected {
            self.observer.on_event(&ProgressEvent::Finished {
                batch_id: self.batch_id,
                received: collected.len(),
                total: self.expected,
                elapsed: started.elapsed(),
            });
        }

        collected
    }
}
