//! Error types for Keymeter
//!
//! Per-key failures (`Transport`, `RemoteStatus`, `Decode`, `QueueFull`,
//! `ProcessingTimeout`) are rendered into a usage record's error string and
//! never abort a batch. `Storage` is the whole-operation failure.

use thiserror::Error;

/// Result type alias using KeymeterError
pub type Result<T> = std::result::Result<T, KeymeterError>;

/// Unified error type for Keymeter operations
#[derive(Debug, Error)]
pub enum KeymeterError {
    // Remote metering errors
    #[error("API request failed: {0}")]
    Transport(String),

    #[error("HTTP {0}")]
    RemoteStatus(u16),

    #[error("failed to decode response: {0}")]
    Decode(String),

    // Scheduling errors
    #[error("task queue full")]
    QueueFull,

    #[error("Processing timeout")]
    ProcessingTimeout,

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists")]
    DuplicateKey,

    #[error("Validation error: {0}")]
    Validation(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Worker pool lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("invalid pool state for {operation}: pool is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("worker pool is stopped")]
    Stopped,
}

impl From<serde_json::Error> for KeymeterError {
    fn from(err: serde_json::Error) -> Self {
        KeymeterError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for KeymeterError {
    fn from(err: config::ConfigError) -> Self {
        KeymeterError::Config(err.to_string())
    }
}
