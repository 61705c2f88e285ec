//! Remote Fetcher
//!
//! One bounded-time lookup per key against the remote metering endpoint.
//! A non-success status is a successful fetch of a failure state and comes
//! back as `Ok` with the record's error set; transport and decode failures
//! come back as `Err` and are turned into placeholders by the coordinator.

pub mod http;

use async_trait::async_trait;
use chrono::DateTime;
use keymeter_common::{mask_credential, Result, UsageRecord, DATE_NOT_APPLICABLE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use http::HttpUsageFetcher;

/// Default remote metering endpoint
pub const DEFAULT_ENDPOINT: &str = "https://app.factory.ai/api/organization/members/chat-usage";

/// Default user agent sent with every lookup
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Looks up usage for a single credential
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageFetcher: Send + Sync {
    /// Fetch and normalize usage for one key
    async fn fetch_usage(&self, key_id: &str, credential: &str) -> Result<UsageRecord>;
}

/// Configuration for the HTTP fetcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Remote metering endpoint
    pub endpoint: String,
    /// Per-request timeout in seconds (shorter than any batch deadline)
    pub request_timeout_secs: u64,
    /// Idle connections kept per host
    pub max_idle_per_host: usize,
    /// Idle connection lifetime in seconds
    pub idle_timeout_secs: u64,
    /// User-Agent header
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout_secs: 15,
            max_idle_per_host: 10,
            idle_timeout_secs: 90,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetcherConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Body returned by the metering endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MeteringResponse {
    #[serde(default)]
    pub usage: UsagePayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsagePayload {
    /// Period start, Unix millis (0 when not applicable)
    #[serde(default)]
    pub start_date: i64,
    /// Period end, Unix millis (0 when not applicable)
    #[serde(default)]
    pub end_date: i64,
    #[serde(default)]
    pub standard: StandardUsage,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardUsage {
    #[serde(default)]
    pub org_total_tokens_used: f64,
    #[serde(default)]
    pub total_allowance: f64,
    #[serde(default)]
    pub used_ratio: f64,
}

impl MeteringResponse {
    /// Normalize into a usage record, masking the echoed credential
    pub fn into_record(self, key_id: &str, credential: &str) -> UsageRecord {
        let usage = self.usage;
        UsageRecord::new(
            key_id,
            format_epoch_millis(usage.start_date),
            format_epoch_millis(usage.end_date),
            usage.standard.total_allowance,
            usage.standard.org_total_tokens_used,
            usage.standard.used_ratio,
        )
        .with_masked_key(mask_credential(credential))
    }
}

/// Format a millisecond epoch as a calendar date; zero maps to `N/A`
pub fn format_epoch_millis(millis: i64) -> String {
    if millis == 0 {
        return DATE_NOT_APPLICABLE.to_string();
    }
    DateTime::from_timestamp(millis / 1000, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| DATE_NOT_APPLICABLE.to_string())
}
