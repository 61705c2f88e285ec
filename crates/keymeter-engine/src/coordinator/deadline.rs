//! Workload-proportional batch deadline

use std::time::Duration;

use super::CoordinatorConfig;

/// `min(base + (keys / workers) * per_item, cap)`, integer division.
///
/// A zero worker count is treated as one worker.
pub fn batch_deadline(keys: usize, workers: usize, config: &CoordinatorConfig) -> Duration {
    let rounds = (keys / workers.max(1)) as u64;
    let millis = config
        .base_timeout_ms
        .saturating_add(rounds.saturating_mul(config.per_item_allowance_ms));
    Duration::from_millis(millis.min(config.max_timeout_ms))
}
