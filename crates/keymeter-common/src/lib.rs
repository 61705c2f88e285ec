//! # Keymeter Common
//!
//! Shared types and errors for the Keymeter usage aggregation engine.
//!
//! ## Core Types
//!
//! - [`Key`]: a stored credential for the remote metering API
//! - [`UsageRecord`]: normalized usage snapshot (or error placeholder) for one key
//! - [`AggregatedReport`]: ordered records plus totals over error-free records
//! - [`KeymeterError`]: unified error type

pub mod error;
pub mod mask;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{KeymeterError, PoolError, Result};
pub use mask::mask_credential;
pub use types::{
    key::{BatchDeleteResult, ImportResult, Key, MaskedKey},
    report::{AggregatedReport, Totals},
    usage::{UsageRecord, DATE_NOT_APPLICABLE},
};

/// Keymeter version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
