//! Core data types for Keymeter

pub mod key;
pub mod report;
pub mod usage;
