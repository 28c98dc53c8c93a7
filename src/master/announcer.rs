//! Master Announcer
//!
//! Game-server side of the master protocol: registers this server, sends a
//! heartbeat with the live player count on a fixed cadence, registers again
//! when the master reports the id as unknown, and reconnects with backoff
//! when the connection drops. On shutdown it unregisters.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use crate::master::protocol::{MasterReply, MasterRequest};
use crate::master::registry::LobbyInfo;
use crate::network::client::Backoff;
use crate::network::codec::{decode, encode, ProtocolError};

type MasterStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Announcer failure within one connection.
#[derive(Debug, Error)]
pub enum AnnounceError {
    /// Connection failed or broke.
    #[error("master connection: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    /// Reply could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Master refused a request.
    #[error("master rejected request: {0}")]
    Rejected(String),

    /// Reply of the wrong type.
    #[error("unexpected master reply: {0:?}")]
    Unexpected(Box<MasterReply>),

    /// Master closed the connection.
    #[error("master closed the connection")]
    Closed,
}

/// Announcer settings.
#[derive(Debug, Clone)]
pub struct AnnouncerConfig {
    /// Master WebSocket URL.
    pub master_url: String,
    /// Details advertised on registration.
    pub info: LobbyInfo,
    /// Registration token, when the master requires one.
    pub token: Option<String>,
    /// Heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Reconnect schedule.
    pub backoff: Backoff,
}

/// Keeps this server listed on a master.
pub struct Announcer {
    config: AnnouncerConfig,
    players: watch::Receiver<u32>,
}

impl Announcer {
    /// Announcer reporting the count published on `players`.
    pub fn new(config: AnnouncerConfig, players: watch::Receiver<u32>) -> Self {
        Self { config, players }
    }

    /// Run until `shutdown` fires.
    #[instrument(skip_all, fields(master = %self.config.master_url))]
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = self.config.backoff.clone();
        loop {
            let connected = tokio::select! {
                result = connect_async(self.config.master_url.as_str()) => result,
                _ = shutdown.recv() => return,
            };
            let ws = match connected {
                Ok((ws, _)) => {
                    backoff.reset();
                    ws
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = delay.as_secs_f64(), "cannot reach master");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown.recv() => return,
                    }
                }
            };

            match self.session(ws, &mut shutdown).await {
                Ok(()) => return,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = delay.as_secs_f64(), "master session ended");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.recv() => return,
                    }
                }
            }
        }
    }

    /// One connection's lifetime. `Ok` means shutdown was requested.
    async fn session(&mut self, mut ws: MasterStream, shutdown: &mut broadcast::Receiver<()>) -> Result<(), AnnounceError> {
        let mut server_id = self.register(&mut ws).await?;
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let cur_players = *self.players.borrow();
                    let beat = MasterRequest::Heartbeat { server_id: server_id.clone(), cur_players };
                    match request(&mut ws, &beat).await? {
                        MasterReply::Heartbeat => debug!(%server_id, cur_players, "heartbeat sent"),
                        MasterReply::Error { message } if message.starts_with("unknown server_id") => {
                            info!(%server_id, "master forgot this server, registering again");
                            server_id = self.register(&mut ws).await?;
                        }
                        MasterReply::Error { message } => return Err(AnnounceError::Rejected(message)),
                        other => return Err(AnnounceError::Unexpected(Box::new(other))),
                    }
                }
                _ = shutdown.recv() => {
                    let bye = MasterRequest::Unregister { server_id: server_id.clone() };
                    if let Err(e) = request(&mut ws, &bye).await {
                        debug!(error = %e, "unregister failed");
                    }
                    let _ = ws.close(None).await;
                    info!(%server_id, "unregistered from master");
                    return Ok(());
                }
            }
        }
    }

    async fn register(&self, ws: &mut MasterStream) -> Result<String, AnnounceError> {
        let mut info = self.config.info.clone();
        info.cur_players = *self.players.borrow();
        let req = MasterRequest::Register {
            info,
            token: self.config.token.clone(),
        };
        match request(ws, &req).await? {
            MasterReply::Register { server_id } => {
                info!(%server_id, "registered with master");
                Ok(server_id)
            }
            MasterReply::Error { message } => Err(AnnounceError::Rejected(message)),
            other => Err(AnnounceError::Unexpected(Box::new(other))),
        }
    }
}

async fn request(ws: &mut MasterStream, req: &MasterRequest) -> Result<MasterReply, AnnounceError> {
    ws.send(Message::Text(encode(req)?)).await?;
    while let Some(frame) = ws.next().await {
        match frame? {
            Message::Text(text) => return Ok(decode::<MasterReply>(&text)?),
            Message::Close(_) => break,
            _ => continue,
        }
    }
    Err(AnnounceError::Closed)
}

// =============================================================================
// TESTS
// =============================================================================
