//! Batch progress reporting

use std::time::Duration;
use tracing::{debug, info, warn};

/// Progress signal emitted while a batch is being collected
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started {
        batch_id: u64,
        total: usize,
        deadline: Duration,
    },
    /// Periodic tick
    Tick {
        batch_id: u64,
        received: usize,
        total: usize,
        elapsed: Duration,
    },
    /// Every N results
    Milestone {
        batch_id: u64,
        received: usize,
        total: usize,
        elapsed: Duration,
    },
    TimedOut {
        batch_id: u64,
        received: usize,
        total: usize,
        elapsed: Duration,
    },
    Finished {
        batch_id: u64,
        received: usize,
        total: usize,
        elapsed: Duration,
    },
}

impl ProgressEvent {
    pub fn batch_id(&self) -> u64 {
        match self {
            ProgressEvent::Started { batch_id, .. }
            | ProgressEvent::Tick { batch_id, .. }
            | ProgressEvent::Milestone { batch_id, .. }
            | ProgressEvent::TimedOut { batch_id, .. }
            | ProgressEvent::Finished { batch_id, .. } => *batch_id,
        }
    }
}

/// Results per second over `elapsed`
pub fn throughput(received: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        0.0
    } else {
        received as f64 / secs
    }
}

/// Receives progress events; must not block
pub trait ProgressObserver: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Default observer that writes progress to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressObserver for TracingProgress {
    fn on_event(&self, event: &ProgressEvent) {
        match *event {
            ProgressEvent::Started {
                batch_id,
                total,
                deadline,
            } => {
                info!(batch_id, total, deadline_secs = deadline.as_secs(), "Batch started");
            }
            ProgressEvent::Tick {
                batch_id,
                received,
                total,
                elapsed,
            } => {
                debug!(
                    batch_id,
                    received,
                    total,
                    elapsed_ms = elapsed.as_millis() as u64,
                    rate = %format!("{:.1}/s", throughput(received, elapsed)),
                    "Batch progress"
                );
            }
            ProgressEvent::Milestone {
                batch_id,
                received,
                total,
                elapsed,
            } => {
                info!(
                    batch_id,
                    received,
                    total,
                    elapsed_ms = elapsed.as_millis() as u64,
                    rate = %format!("{:.1}/s", throughput(received, elapsed)),
                    "Batch milestone"
                );
            }
            ProgressEvent::TimedOut {
                batch_id,
                received,
                total,
                elapsed,
            } => {
                warn!(
                    batch_id,
                    received,
                    missing = total.saturating_sub(received),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Batch deadline reached"
                );
            }
            ProgressEvent::Finished {
                batch_id,
                received,
                total,
                elapsed,
            } => {
                info!(
                    batch_id,
                    received,
                    total,
                    elapsed_ms = elapsed.as_millis() as u64,
                    rate = %format!("{:.1}/s", throughput(received, elapsed)),
                    "Batch finished"
                );
            }
        }
    }
}
