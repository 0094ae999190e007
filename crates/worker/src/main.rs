use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use stepwise_worker::WorkerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stepwise_worker=debug,stepwise_durable=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("stepwise-worker starting...");

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Received shutdown signal");
    };

    if let Err(e) = stepwise_worker::run(config, shutdown).await {
        tracing::error!(error = %e, "Worker error");
        return Err(e);
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
