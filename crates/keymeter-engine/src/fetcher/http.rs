//! HTTP implementation of the usage fetcher over one shared `reqwest::Client`

use async_trait::async_trait;
use keymeter_common::{KeymeterError, Result, UsageRecord};
use reqwest::StatusCode;
use tracing::{debug, instrument};

use super::{FetcherConfig, MeteringResponse, UsageFetcher};

/// Fetches usage from the remote metering endpoint.
///
/// The client (and its idle-connection pool) is built once and shared by
/// every worker.
#[derive(Clone)]
pub struct HttpUsageFetcher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpUsageFetcher {
    /// Build the shared client from configuration
    pub fn new(config: &FetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout())
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| KeymeterError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait]
impl UsageFetcher for HttpUsageFetcher {
    #[instrument(skip(self, credential))]
    async fn fetch_usage(&self, key_id: &str, credential: &str) -> Result<UsageRecord> {
        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| KeymeterError::Transport(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            debug!(status = status.as_u16(), "Remote returned non-success status");
            return Ok(UsageRecord::failed(
                key_id,
                KeymeterError::RemoteStatus(status.as_u16()).to_string(),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| KeymeterError::Transport(e.to_string()))?;

        let parsed: MeteringResponse =
            serde_json::from_slice(&body).map_err(|e| KeymeterError::Decode(e.to_string()))?;

        Ok(parsed.into_record(key_id, credential))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{header, HeaderMap, StatusCode as AxumStatus},
        routing::get,
        Json, Router,
    };

    const GOOD_TOKEN: &str = "fk-good-credential-0001";

    async fn usage_handler(headers: HeaderMap) -> (AxumStatus, Json<serde_json::Value>) {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if auth != format!("Bearer {}", GOOD_TOKEN) {
            return (AxumStatus::UNAUTHORIZED, Json(serde_json::json!({"error": "denied"})));
        }

        (
            AxumStatus::OK,
            Json(serde_json::json!({
                "usage": {
                    "startDate": 1704067200000i64,
                    "endDate": 1706745600000i64,
                    "standard": {
                        "orgTotalTokensUsed": 1200.0,
                        "totalAllowance": 20000.0,
                        "usedRatio": 0.06
                    }
                }
            })),
        )
    }

    async fn spawn_remote() -> String {
        let app = Router::new()
            .route("/usage", get(usage_handler))
            .route("/garbage", get(|| async { "definitely not json" }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fetcher_for(endpoint: String) -> HttpUsageFetcher {
        let config = FetcherConfig {
            endpoint,
            request_timeout_secs: 2,
            ..FetcherConfig::default()
        };
        HttpUsageFetcher::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_successful_fetch() {
        let base = spawn_remote().await;
        let fetcher = fetcher_for(format!("{}/usage", base));

        let record = fetcher.fetch_usage("key-a", GOOD_TOKEN).await.unwrap();
        assert!(record.is_ok());
        assert_eq!(record.id, "key-a");
        assert_eq!(record.start_date, "2024-01-01");
        assert_eq!(record.end_date, "2024-02-01");
        assert_eq!(record.remaining, 18800.0);
        assert_eq!(record.key.as_deref(), Some("fk-g...0001"));
    }

    #[tokio::test]
    async fn test_status_error_is_a_record() {
        let base = spawn_remote().await;
        let fetcher = fetcher_for(format!("{}/usage", base));

        let record = fetcher.fetch_usage("key-b", "fk-wrong-credential").await.unwrap();
        assert_eq!(record.error.as_deref(), Some("HTTP 401"));
        assert_eq!(record.id, "key-b");
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let base = spawn_remote().await;
        let fetcher = fetcher_for(format!("{}/garbage", base));

        let err = fetcher.fetch_usage("key-c", GOOD_TOKEN).await.unwrap_err();
        assert!(matches!(err, KeymeterError::Decode(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher = fetcher_for(format!("http://{}/usage", addr));
        let err = fetcher.fetch_usage("key-d", GOOD_TOKEN).await.unwrap_err();
        assert!(matches!(err, KeymeterError::Transport(_)));
    }
}
