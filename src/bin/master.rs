//! Oko Master Server
//!
//! Directory of live game servers. Game servers register and heartbeat;
//! clients list them with optional mode, region and build filters.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oko_zombie::{
    config::Settings,
    core::clock::system_clock,
    master::{MasterConfig, MasterServer},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env().context("reading OKO_* settings")?;
    let config = MasterConfig::from_settings(&settings);
    info!("Oko Master v{}", VERSION);
    info!(
        bind = %config.bind_addr,
        timeout_secs = config.timeout_secs,
        auth = config.auth.is_configured(),
        "configuration loaded"
    );

    let server = Arc::new(MasterServer::new(config, system_clock()));
    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
        signal_server.shutdown();
    });

    server.run().await.context("master server failed")?;
    info!("master stopped");
    Ok(())
}
