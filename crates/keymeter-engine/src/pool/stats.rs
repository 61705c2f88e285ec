//! Pool lifecycle state and live counters

use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker pool lifecycle: `Created -> Running -> Draining -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PoolState {
    Created = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

impl PoolState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => PoolState::Created,
            1 => PoolState::Running,
            2 => PoolState::Draining,
            _ => PoolState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Created => "created",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Stopped => "stopped",
        }
    }

    /// Whether new tasks are still accepted
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, PoolState::Created | PoolState::Running)
    }
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of pool counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Worker loops currently alive
    pub active_workers: usize,
    /// Tasks waiting in the task queue
    pub queue_size: usize,
    /// Results waiting to be collected
    pub result_queue_size: usize,
    /// Tasks fetched since start
    pub processed_tasks: u64,
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub state: PoolState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_through_u8() {
        for state in [
            PoolState::Created,
            PoolState::Running,
            PoolState::Draining,
            PoolState::Stopped,
        ] {
            assert_eq!(PoolState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_accepts_tasks() {
        assert!(PoolState::Created.accepts_tasks());
        assert!(PoolState::Running.accepts_tasks());
        assert!(!PoolState::Draining.accepts_tasks());
        assert!(!PoolState::Stopped.accepts_tasks());
    }

    #[test]
    fn test_stats_serialize_state_lowercase() {
        let stats = PoolStats {
            active_workers: 3,
            queue_size: 0,
            result_queue_size: 0,
            processed_tasks: 12,
            max_workers: 3,
            queue_capacity: 10,
            state: PoolState::Running,
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "running");
        assert_eq!(json["processed_tasks"], 12);
    }
}
