//! Keymeter Server Binary
//!
//! HTTP front end for key management and aggregated usage reports.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use keymeter_engine::{KeymeterConfig, UsageService};

mod routes;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Keymeter v{}", keymeter_common::VERSION);

    let config = KeymeterConfig::load()?;
    info!(
        workers = config.pool.max_workers,
        queue = config.pool.queue_size,
        redis = config.redis.is_enabled(),
        "Loaded configuration"
    );

    let service = Arc::new(UsageService::from_config(&config).await?);
    service.start()?;

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, routes::router(service.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    service.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Received shutdown signal");
}
