//! Dice Duel Server
//!
//! Contest and matchmaking server for Dice Duel.

use std::sync::Arc;
use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dice_duel::{
    app::{connect_cache, AppConfig, Services},
    core::SystemClock,
    network::{ConnectionRegistry, DuelServer},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Dice Duel Server v{}", VERSION);

    let config = AppConfig::from_env();
    info!(
        "Matchmaking every {:?}, batch {}",
        config.matchmaking.interval, config.matchmaking.batch_size
    );

    let cache = connect_cache(&config.store).await.context("opening session cache")?;
    let registry = Arc::new(ConnectionRegistry::new());
    let services = Services::build(&config, Arc::new(SystemClock), cache, registry.clone())
        .context("credential secrets must be set (CREDENTIAL_SIGNING_SECRET, CREDENTIAL_ENCRYPTION_KEY)")?;

    let server = Arc::new(DuelServer::new(config.server.clone(), Arc::new(services), registry));

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_server.shutdown();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    server.run().await.context("server stopped with an error")?;
    info!("Server stopped");
    Ok(())
}
