//! Oko Game Server
//!
//! Authoritative lobby and match server for Oko. Settings come from `OKO_*`
//! environment variables; when `OKO_MASTER_URL` is set the server also
//! announces itself to a master directory.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oko_zombie::{
    config::Settings,
    core::clock::system_clock,
    master::{
        auth::issue_token,
        registry::LobbyInfo,
        Announcer, AnnouncerConfig,
    },
    network::{protocol::PROTOCOL_VERSION, GameServer, ServerConfig},
    VERSION,
};

/// Registration tokens are minted per process start.
const TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env().context("reading OKO_* settings")?;
    info!("Oko Server v{}", VERSION);
    info!(bind = %settings.bind_addr, public_host = %settings.public_host, "configuration loaded");

    let clock = system_clock();
    let server = Arc::new(GameServer::new(ServerConfig::from_settings(&settings), clock.clone()));

    let announcer = match &settings.master_url {
        Some(url) => {
            let token = match &settings.master_token_secret {
                Some(secret) => Some(
                    issue_token(&settings.server_name, secret, clock.now() as u64, TOKEN_TTL_SECS)
                        .context("minting master token")?,
                ),
                None => None,
            };
            let config = AnnouncerConfig {
                master_url: url.clone(),
                info: LobbyInfo {
                    host: settings.public_host.clone(),
                    port: settings.bind_addr.port(),
                    name: settings.server_name.clone(),
                    mode: "coop".to_string(),
                    max_players: settings.max_players,
                    cur_players: 0,
                    region: settings.region.clone(),
                    build: VERSION.to_string(),
                    protocol: PROTOCOL_VERSION,
                },
                token,
                heartbeat_interval: settings.heartbeat_interval(),
                backoff: settings.backoff(),
            };
            let announcer = Announcer::new(config, server.player_count());
            Some(tokio::spawn(announcer.run(server.subscribe_shutdown())))
        }
        None => None,
    };

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
        signal_server.shutdown();
    });

    server.run().await.context("game server failed")?;

    if let Some(handle) = announcer {
        let _ = handle.await;
    }
    info!("server stopped");
    Ok(())
}
