mod config;
mod engine;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load().context("Failed to load configuration")?;
    info!(
        "Starting La-Vak daemon as '{}' (downloads: {})",
        config.device.name,
        config.transfers.downloads_dir.display()
    );

    // RSA-4096 generation is slow; do it before anything connects
    lavak_protocol::crypto::process_keys().context("Failed to generate process keypair")?;

    let mut engine = Engine::start(&config)
        .await
        .context("Failed to start engine")?;

    engine.run().await
}
