//! Runs a log poller for the chain in the loaded settings until ctrl-c.

use eyre::{Context, Result};
use tracing::info;

use logpoller::settings::Settings;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    settings.tracing.start_tracing()?;

    let log_poller = settings.build_log_poller().await?;
    log_poller.start()?;
    info!(name = log_poller.name(), "Log poller running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    log_poller.close().await?;
    Ok(())
}
