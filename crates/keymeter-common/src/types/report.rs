//! Aggregated usage report

use chrono::Local;
use serde::{Deserialize, Serialize};

use super::usage::UsageRecord;

/// Display format for `update_time`
pub const UPDATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Summed totals over error-free records
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    #[serde(rename = "total_orgTotalTokensUsed")]
    pub total_org_total_tokens_used: f64,
    #[serde(rename = "total_totalAllowance")]
    pub total_allowance: f64,
}

impl Totals {
    /// Sum allowance and usage, skipping any record with an error
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UsageRecord>) -> Self {
        records
            .into_iter()
            .filter(|r| r.is_ok())
            .fold(Totals::default(), |mut acc, r| {
                acc.total_org_total_tokens_used += r.org_total_used;
                acc.total_allowance += r.total_allowance;
                acc
            })
    }
}

/// Report returned by the aggregation operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedReport {
    pub update_time: String,
    pub total_count: usize,
    pub totals: Totals,
    pub data: Vec<UsageRecord>,
}

impl AggregatedReport {
    /// Build a report stamped with the current local time
    pub fn new(data: Vec<UsageRecord>) -> Self {
        Self {
            update_time: Local::now().format(UPDATE_TIME_FORMAT).to_string(),
            total_count: data.len(),
            totals: Totals::from_records(&data),
            data,
        }
    }

    /// Well-formed report for zero keys
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Records without an error
    pub fn healthy(&self) -> impl Iterator<Item = &UsageRecord> {
        self.data.iter().filter(|r| r.is_ok())
    }
}
