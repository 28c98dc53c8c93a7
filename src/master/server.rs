//! Master Directory Server
//!
//! WebSocket front end for the [`MasterRegistry`]. Each connection runs in
//! its own task and forwards decoded requests over a channel to a single
//! registry task, which is the only code that touches the registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Settings;
use crate::core::clock::SharedClock;
use crate::master::auth::{verify_registration, AuthConfig};
use crate::master::protocol::{MasterReply, MasterRequest};
use crate::master::registry::MasterRegistry;
use crate::network::codec::{decode, encode};
use crate::network::security::{validate_master_payload, IpLimiter};

/// Master configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Entry timeout, seconds.
    pub timeout_secs: f64,
    /// Requests per IP per minute.
    pub requests_per_min: u32,
    /// Rate-limit violations before a connection is closed; `0` never closes.
    pub max_strikes: u32,
    /// Registration token checks.
    pub auth: AuthConfig,
    /// How often expired entries are swept.
    pub sweep_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl MasterConfig {
    /// Config from runtime settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bind_addr: settings.master_bind_addr,
            timeout_secs: settings.registry_timeout_secs as f64,
            requests_per_min: settings.master_requests_per_min,
            max_strikes: settings.rate_limit_strikes,
            auth: settings.master_auth(),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Master server errors.
#[derive(Debug, Error)]
pub enum MasterServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),
}

enum RegistryCommand {
    Request {
        request: MasterRequest,
        reply: oneshot::Sender<MasterReply>,
    },
    Sweep,
}

/// Apply one request to the registry.
pub fn handle_request(registry: &mut MasterRegistry, auth: &AuthConfig, request: MasterRequest) -> MasterReply {
    match request {
        MasterRequest::Register { info, token } => {
            if let Err(e) = verify_registration(token.as_deref(), auth) {
                warn!(host = %info.host, error = %e, "registration token rejected");
                return MasterReply::error(e.to_string());
            }
            if let Err(e) = validate_master_payload(&info) {
                warn!(host = %info.host, error = %e, "registration payload rejected");
                return MasterReply::error(e.to_string());
            }
            MasterReply::Register {
                server_id: registry.register(info),
            }
        }
        MasterRequest::Heartbeat { server_id, cur_players } => match registry.heartbeat(&server_id, cur_players) {
            Ok(()) => MasterReply::Heartbeat,
            Err(e) => MasterReply::error(e.to_string()),
        },
        MasterRequest::Unregister { server_id } => {
            registry.unregister(&server_id);
            MasterReply::Unregister
        }
        MasterRequest::List { filter, limit } => MasterReply::List {
            servers: registry.list(&filter, limit),
        },
        MasterRequest::Ping => MasterReply::Ping,
    }
}

/// The master server.
pub struct MasterServer {
    config: MasterConfig,
    clock: SharedClock,
    shutdown_tx: broadcast::Sender<()>,
}

impl MasterServer {
    /// Create a new master server.
    pub fn new(config: MasterConfig, clock: SharedClock) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            clock,
            shutdown_tx,
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), MasterServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), MasterServerError> {
        info!(addr = ?listener.local_addr().ok(), "master server listening");

        let (registry_tx, registry_rx) = mpsc::channel(256);
        let registry = MasterRegistry::new(self.config.timeout_secs, self.clock.clone());
        let registry_handle = tokio::spawn(Self::run_registry(registry, self.config.auth.clone(), registry_rx));

        let sweep_tx = registry_tx.clone();
        let period = self.config.sweep_interval;
        let sweep_handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if sweep_tx.send(RegistryCommand::Sweep).await.is_err() {
                    break;
                }
            }
        });

        let limiter = Arc::new(IpLimiter::per_minute(self.config.requests_per_min));
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(%addr, "master connection");
                            tokio::spawn(Self::handle_connection(
                                stream,
                                addr,
                                registry_tx.clone(),
                                limiter.clone(),
                                self.config.max_strikes,
                                self.shutdown_tx.subscribe(),
                            ));
                        }
                        Err(e) => error!(error = %e, "accept error"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("master shutdown signal received");
                    break;
                }
            }
        }

        sweep_handle.abort();
        registry_handle.abort();
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    async fn run_registry(mut registry: MasterRegistry, auth: AuthConfig, mut rx: mpsc::Receiver<RegistryCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RegistryCommand::Request { request, reply } => {
                    let _ = reply.send(handle_request(&mut registry, &auth, request));
                }
                RegistryCommand::Sweep => {
                    let purged = registry.purge();
                    if purged > 0 {
                        debug!(purged, remaining = registry.len(), "registry sweep");
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry_tx: mpsc::Sender<RegistryCommand>,
        limiter: Arc<IpLimiter>,
        max_strikes: u32,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%addr, error = %e, "websocket handshake failed");
                return;
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut strikes = 0u32;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(%addr, error = %e, "master connection error");
                            break;
                        }
                        Some(Ok(_)) => continue,
                    };

                    let reply = if !limiter.check(addr.ip()) {
                        strikes += 1;
                        MasterReply::error("rate limited")
                    } else {
                        match decode::<MasterRequest>(&text) {
                            Ok(request) => {
                                let (reply_tx, reply_rx) = oneshot::channel();
                                let cmd = RegistryCommand::Request { request, reply: reply_tx };
                                if registry_tx.send(cmd).await.is_err() {
                                    break;
                                }
                                match reply_rx.await {
                                    Ok(reply) => reply,
                                    Err(_) => break,
                                }
                            }
                            Err(e) => {
                                debug!(%addr, error = %e, "rejected master message");
                                MasterReply::error(e.to_string())
                            }
                        }
                    };

                    match encode(&reply) {
                        Ok(text) => {
                            if ws_sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => error!(error = %e, "failed to encode master reply"),
                    }

                    if max_strikes > 0 && strikes >= max_strikes {
                        warn!(%addr, strikes, "closing rate-limited master connection");
                        break;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        let _ = ws_sender.close().await;
        debug!(%addr, "master connection closed");
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::master::auth::issue_token;
    use crate::master::registry::{ListFilter, LobbyInfo};
    use tokio_tungstenite::connect_async;

    fn info() -> LobbyInfo {
        LobbyInfo {
            host: "10.0.0.5".into(),
            port: 8765,
            name: "den".into(),
            mode: "coop".into(),
            max_players: 4,
            cur_players: 0,
            region: "eu".into(),
            build: "1.0".into(),
            protocol: 1,
        }
    }

    #[test]
    fn test_handle_request_flow() {
        let clock = ManualClock::new(0.0);
        let mut registry = MasterRegistry::new(45.0, clock.clone());
        let auth = AuthConfig::default();

        let server_id = match handle_request(&mut registry, &auth, MasterRequest::Register { info: info(), token: None }) {
            MasterReply::Register { server_id } => server_id,
            other => panic!("unexpected {other:?}"),
        };
        let beat = MasterRequest::Heartbeat {
            server_id: server_id.clone(),
            cur_players: 2,
        };
        assert_eq!(handle_request(&mut registry, &auth, beat.clone()), MasterReply::Heartbeat);

        match handle_request(&mut registry, &auth, MasterRequest::List { filter: ListFilter::default(), limit: None }) {
            MasterReply::List { servers } => assert_eq!(servers[0].info.cur_players, 2),
            other => panic!("unexpected {other:?}"),
        }

        clock.advance(100.0);
        match handle_request(&mut registry, &auth, beat) {
            MasterReply::Error { message } => assert!(message.starts_with("unknown server_id")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(handle_request(&mut registry, &auth, MasterRequest::Ping), MasterReply::Ping);
    }

    #[test]
    fn test_register_checks() {
        let clock = ManualClock::new(0.0);
        let mut registry = MasterRegistry::new(45.0, clock);
        let auth = AuthConfig::with_secret("s3cret");

        let reply = handle_request(&mut registry, &auth, MasterRequest::Register { info: info(), token: None });
        assert!(matches!(reply, MasterReply::Error { .. }));

        let token = issue_token("den", "s3cret", chrono::Utc::now().timestamp() as u64, 600).unwrap();
        let mut bad = info();
        bad.name = "n".repeat(100);
        let reply = handle_request(
            &mut registry,
            &auth,
            MasterRequest::Register {
                info: bad,
                token: Some(token.clone()),
            },
        );
        assert!(matches!(reply, MasterReply::Error { .. }));

        let reply = handle_request(&mut registry, &auth, MasterRequest::Register { info: info(), token: Some(token) });
        assert!(matches!(reply, MasterReply::Register { .. }));
        assert_eq!(registry.len(), 1);
    }

    async fn roundtrip<S>(ws: &mut S, text: &str) -> MasterReply
    where
        S: SinkExt<Message> + StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let _ = ws.send(Message::Text(text.to_string())).await;
        loop {
            if let Some(Ok(Message::Text(reply))) = ws.next().await {
                return decode::<MasterReply>(&reply).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(MasterServer::new(MasterConfig::default(), crate::core::clock::system_clock()));
        let running = server.clone();
        let task = tokio::spawn(async move { running.serve(listener).await });

        let (mut ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let reply = roundtrip(&mut ws, r#"{"t":"REGISTER","v":1,"host":"10.0.0.5","port":8765,"name":"den","max_players":4}"#).await;
        assert!(matches!(reply, MasterReply::Register { .. }));

        let reply = roundtrip(&mut ws, "not json").await;
        assert!(matches!(reply, MasterReply::Error { .. }));

        match roundtrip(&mut ws, r#"{"t":"LIST"}"#).await {
            MasterReply::List { servers } => assert_eq!(servers.len(), 1),
            other => panic!("unexpected {other:?}"),
        }

        server.shutdown();
        let _ = task.await;
    }
}
