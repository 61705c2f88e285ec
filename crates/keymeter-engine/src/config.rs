//! Keymeter configuration
//!
//! Layered: built-in defaults, then an optional TOML file, then
//! `KEYMETER_`-prefixed environment variables (`__` separates sections,
//! e.g. `KEYMETER_POOL__MAX_WORKERS=50`). `PORT` overrides the server port.

use config::{Config, Environment, File};
use keymeter_common::Result;
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatorConfig;
use crate::coordinator::CoordinatorConfig;
use crate::fetcher::FetcherConfig;
use crate::pool::PoolConfig;

/// Config file used when `KEYMETER_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "keymeter.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeymeterConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub pool: PoolConfig,
    pub fetcher: FetcherConfig,
    pub coordinator: CoordinatorConfig,
    pub cache: AggregatorConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Redis settings; an empty URL selects the in-memory store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".to_string(),
            prefix: crate::store::redis::DEFAULT_PREFIX.to_string(),
        }
    }
}

impl RedisConfig {
    pub fn is_enabled(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

impl KeymeterConfig {
    /// Load configuration from `.env`, the config file and the environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let path =
            std::env::var("KEYMETER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let mut cfg = Self::load_from(&path)?;

        // Platform-assigned port takes priority
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse::<u16>() {
                cfg.server.port = p;
            }
        }

        Ok(cfg)
    }

    /// Defaults, then `path` if it exists, then `KEYMETER_*` variables
    pub fn load_from(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("KEYMETER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(cfg)
    }

    /// `host:port` for the HTTP listener
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = KeymeterConfig::default();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.pool.max_workers, 100);
        assert_eq!(cfg.pool.queue_size, 10000);
        assert_eq!(cfg.pool.submit_timeout_ms, 5000);
        assert_eq!(cfg.fetcher.request_timeout_secs, 15);
        assert_eq!(cfg.coordinator.base_timeout_ms, 30_000);
        assert_eq!(cfg.cache.freshness_window_secs, 300);
        assert_eq!(cfg.cache.local_cache_size, 1000);
        assert!(cfg.redis.is_enabled());
        assert_eq!(cfg.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = KeymeterConfig::load_from("/nonexistent/keymeter-config").unwrap();
        assert_eq!(cfg.pool.max_workers, 100);
        assert_eq!(cfg.redis.prefix, "keymeter");
    }

    #[test]
    fn test_file_overrides_selected_fields() {
        let path = std::env::temp_dir().join(format!("keymeter-test-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[pool]
max_workers = 8

[cache]
freshness_window_secs = 60

[redis]
url = ""
"#,
        )
        .unwrap();

        let cfg = KeymeterConfig::load_from(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.pool.max_workers, 8);
        assert_eq!(cfg.pool.queue_size, 10000);
        assert_eq!(cfg.cache.freshness_window_secs, 60);
        assert_eq!(cfg.cache.cache_ttl_secs, 300);
        assert!(!cfg.redis.is_enabled());
    }
}
