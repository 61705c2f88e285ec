//! Normalized usage records
//!
//! A record is either a successfully parsed usage snapshot or a placeholder
//! carrying only an identifier and an error string. Records with an error
//! never contribute to report totals and are never written to the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sentinel used for billing-period bounds the remote reports as zero
pub const DATE_NOT_APPLICABLE: &str = "N/A";

/// Usage snapshot for one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Key identifier
    pub id: String,
    /// Masked credential, present only on freshly fetched records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Billing period start (`%Y-%m-%d` or `N/A`)
    #[serde(default)]
    pub start_date: String,
    /// Billing period end (`%Y-%m-%d` or `N/A`)
    #[serde(default)]
    pub end_date: String,
    /// Total token allowance
    #[serde(default)]
    pub total_allowance: f64,
    /// Tokens used by the organization
    #[serde(default, rename = "org_total_tokens_used", alias = "org_total_used")]
    pub org_total_used: f64,
    /// allowance - used
    #[serde(default)]
    pub remaining: f64,
    /// Used fraction as reported by the remote
    #[serde(default)]
    pub used_ratio: f64,
    /// When this snapshot was taken
    #[serde(default)]
    pub last_updated: DateTime<Utc>,
    /// Error description for degraded keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UsageRecord {
    /// Build a successful snapshot; `remaining` is derived
    pub fn new(
        id: impl Into<String>,
        start_date: impl Into<String>,
        end_date: impl Into<String>,
        total_allowance: f64,
        org_total_used: f64,
        used_ratio: f64,
    ) -> Self {
        Self {
            id: id.into(),
            key: None,
            start_date: start_date.into(),
            end_date: end_date.into(),
            total_allowance,
            org_total_used,
            remaining: total_allowance - org_total_used,
            used_ratio,
            last_updated: Utc::now(),
            error: None,
        }
    }

    /// Placeholder record whose only populated field is the error
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: None,
            start_date: String::new(),
            end_date: String::new(),
            total_allowance: 0.0,
            org_total_used: 0.0,
            remaining: 0.0,
            used_ratio: 0.0,
            last_updated: DateTime::<Utc>::default(),
            error: Some(error.into()),
        }
    }

    /// Attach the masked credential
    pub fn with_masked_key(mut self, masked: impl Into<String>) -> Self {
        self.key = Some(masked.into());
        self
    }

    /// Override the snapshot time
    pub fn with_last_updated(mut self, last_updated: DateTime<Utc>) -> Self {
        self.last_updated = last_updated;
        self
    }

    /// True when the record carries no error
    pub fn is_ok(&self) -> bool {
        self.error.as_deref().map_or(true, str::is_empty)
    }

    /// Whether the snapshot is younger than `window` at `now`.
    ///
    /// Snapshots stamped in the future count as fresh.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match (now - self.last_updated).to_std() {
            Ok(age) => age < window,
            Err(_) => true,
        }
    }
}
