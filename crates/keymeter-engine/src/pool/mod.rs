//! Worker Pool
//!
//! A fixed number of long-lived workers share one bounded task queue and
//! publish into one bounded result queue. Shutdown is cooperative: workers
//! observe a cancellation token before taking a task and while publishing,
//! never in the middle of a fetch.

pub mod stats;

use futures::future::join_all;
use keymeter_common::{Key, KeymeterError, PoolError, Result, UsageRecord};
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fetcher::UsageFetcher;

pub use stats::{PoolState, PoolStats};

/// Configuration for the worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of worker loops launched by `start`
    pub max_workers: usize,
    /// Capacity of the task queue and of the result queue
    pub queue_size: usize,
    /// How long `submit_task` waits for queue space
    pub submit_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 100,
            queue_size: 10000,
            submit_timeout_ms: 5000,
        }
    }
}

impl PoolConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

/// One unit of work: fetch usage for a single key
#[derive(Debug, Clone)]
pub struct Task {
    pub batch_id: u64,
    pub key_id: String,
    pub credential: String,
}

impl Task {
    pub fn new(batch_id: u64, key: &Key) -> Self {
        Self {
            batch_id,
            key_id: key.id.clone(),
            credential: key.key.clone(),
        }
    }
}

/// Outcome of one task as published by a worker
#[derive(Debug)]
pub struct TaskResult {
    pub batch_id: u64,
    pub key_id: String,
    pub outcome: Result<UsageRecord>,
}

impl TaskResult {
    /// Collapse into a report entry; fetch errors become placeholders
    pub fn into_record(self) -> UsageRecord {
        match self.outcome {
            Ok(record) => record,
            Err(e) => UsageRecord::failed(self.key_id, e.to_string()),
        }
    }
}

/// Fixed-size pool of fetch workers
pub struct WorkerPool {
    config: PoolConfig,
    fetcher: Arc<dyn UsageFetcher>,
    task_tx: RwLock<Option<mpsc::Sender<Task>>>,
    task_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    result_tx: RwLock<Option<mpsc::Sender<TaskResult>>>,
    result_rx: Arc<Mutex<mpsc::Receiver<TaskResult>>>,
    cancel: CancellationToken,
    handles: SyncMutex<Vec<JoinHandle<()>>>,
    state: AtomicU8,
    active_workers: Arc<AtomicUsize>,
    processed_tasks: Arc<AtomicU64>,
    next_batch_id: AtomicU64,
}

impl WorkerPool {
    /// Create a pool in the `Created` state. Queues exist immediately, so
    /// tasks may be submitted before `start`.
    pub fn new(config: PoolConfig, fetcher: Arc<dyn UsageFetcher>) -> Self {
        let capacity = config.queue_size.max(1);
        let (task_tx, task_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        Self {
            config,
            fetcher,
            task_tx: RwLock::new(Some(task_tx)),
            task_rx: Arc::new(Mutex::new(task_rx)),
            result_tx: RwLock::new(Some(result_tx)),
            result_rx: Arc::new(Mutex::new(result_rx)),
            cancel: CancellationToken::new(),
            handles: SyncMutex::new(Vec::new()),
            state: AtomicU8::new(PoolState::Created as u8),
            active_workers: Arc::new(AtomicUsize::new(0)),
            processed_tasks: Arc::new(AtomicU64::new(0)),
            next_batch_id: AtomicU64::new(1),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.config.max_workers
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Hand out a fresh batch id for tagging tasks
    pub fn next_batch_id(&self) -> u64 {
        self.next_batch_id.fetch_add(1, Ordering::Relaxed)
    }

    fn transition(&self, from: PoolState, to: PoolState, operation: &'static str) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| {
                PoolError::InvalidState {
                    operation,
                    state: PoolState::from_u8(current).as_str(),
                }
                .into()
            })
    }

    /// Launch the worker loops
    pub fn start(&self) -> Result<()> {
        self.transition(PoolState::Created, PoolState::Running, "start")?;

        let result_tx = self
            .result_tx
            .read()
            .clone()
            .ok_or(KeymeterError::Pool(PoolError::Stopped))?;

        let mut handles = self.handles.lock();
        for worker_id in 0..self.config.max_workers {
            let worker = Worker {
                id: worker_id,
                fetcher: self.fetcher.clone(),
                tasks: self.task_rx.clone(),
                results: result_tx.clone(),
                cancel: self.cancel.clone(),
                active_workers: self.active_workers.clone(),
                processed_tasks: self.processed_tasks.clone(),
            };
            handles.push(tokio::spawn(worker.run()));
        }

        info!(workers = self.config.max_workers, "Worker pool started");
        Ok(())
    }

    /// Signal shutdown, wait for every worker to exit, then close both queues.
    ///
    /// Valid exactly once, on a running pool.
    pub async fn stop(&self) -> Result<()> {
        self.transition(PoolState::Running, PoolState::Draining, "stop")?;
        info!("Stopping worker pool");

        self.cancel.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!("Worker exited abnormally: {}", e);
            }
        }

        self.task_tx.write().take();
        self.result_tx.write().take();
        self.task_rx.lock().await.close();
        // A batch still holding the result receiver sees the channel end once
        // every sender is gone.
        if let Ok(mut results) = self.result_rx.try_lock() {
            results.close();
        }

        self.state.store(PoolState::Stopped as u8, Ordering::Release);
        info!(
            processed = self.processed_tasks.load(Ordering::Relaxed),
            "Worker pool stopped"
        );
        Ok(())
    }

    fn sender(&self) -> Result<mpsc::Sender<Task>> {
        if !self.state().accepts_tasks() {
            return Err(PoolError::Stopped.into());
        }
        self.task_tx
            .read()
            .clone()
            .ok_or(KeymeterError::Pool(PoolError::Stopped))
    }

    /// Enqueue a task, waiting up to the configured submit timeout for space
    pub async fn submit_task(&self, task: Task) -> Result<()> {
        let tx = self.sender()?;
        match tx.send_timeout(task, self.config.submit_timeout()).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(task)) => {
                debug!(key_id = %task.key_id, "Task queue stayed full");
                Err(KeymeterError::QueueFull)
            }
            Err(SendTimeoutError::Closed(_)) => Err(PoolError::Stopped.into()),
        }
    }

    /// Enqueue a task without waiting
    pub fn try_submit(&self, task: Task) -> Result<()> {
        let tx = self.sender()?;
        match tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(KeymeterError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(PoolError::Stopped.into()),
        }
    }

    /// Exclusive access to the result queue.
    ///
    /// Held by a batch for its whole collection phase.
    pub async fn lock_results(&self) -> OwnedMutexGuard<mpsc::Receiver<TaskResult>> {
        self.result_rx.clone().lock_owned().await
    }

    /// Live counters
    pub fn stats(&self) -> PoolStats {
        fn depth<T>(tx: &Option<mpsc::Sender<T>>) -> usize {
            tx.as_ref()
                .map(|tx| tx.max_capacity() - tx.capacity())
                .unwrap_or(0)
        }

        PoolStats {
            active_workers: self.active_workers.load(Ordering::Relaxed),
            queue_size: depth(&self.task_tx.read()),
            result_queue_size: depth(&self.result_tx.read()),
            processed_tasks: self.processed_tasks.load(Ordering::Relaxed),
            max_workers: self.config.max_workers,
            queue_capacity: self.config.queue_size.max(1),
            state: self.state(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Worker {
    id: usize,
    fetcher: Arc<dyn UsageFetcher>,
    tasks: Arc<Mutex<mpsc::Receiver<Task>>>,
    results: mpsc::Sender<TaskResult>,
    cancel: CancellationToken,
    active_workers: Arc<AtomicUsize>,
    processed_tasks: Arc<AtomicU64>,
}

impl Worker {
    async fn run(self) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                task = async { self.tasks.lock().await.recv().await } => task,
            };

            let Some(task) = next else {
                debug!(worker = self.id, "Task queue closed");
                break;
            };

            let outcome = self.fetcher.fetch_usage(&task.key_id, &task.credential).await;

            if let Err(e) = &outcome {
                debug!(worker = self.id, key_id = %task.key_id, "Fetch failed: {}", e);
            }

            let result = TaskResult {
                batch_id: task.batch_id,
                key_id: task.key_id,
                outcome,
            };

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!(worker = self.id, "Shutdown while publishing, dropping result");
                    break;
                }
                sent = self.results.send(result) => {
                    if sent.is_err() {
                        break;
                    }
                    self.processed_tasks.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.active_workers.fetch_sub(1, Ordering::Relaxed);
        debug!(worker = self.id, "Worker exited");
    }
}
