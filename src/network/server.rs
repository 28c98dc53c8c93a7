//! WebSocket Game Server
//!
//! Async WebSocket server for multiplayer connections. Every connection
//! runs in its own task that owns the socket, the session's rate limits and
//! the ping/idle timer. Lobby, room, invite and ban state lives in a single
//! hub task; connection tasks talk to it only through a command channel,
//! so all of that state has exactly one writer and needs no locks.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::core::clock::SharedClock;
use crate::game::state::GameMode;
use crate::network::client::{Outbox, RttTracker};
use crate::network::codec::{decode, encode};
use crate::network::invite::{Invite, InviteBook};
use crate::network::lobby::{LobbyError, LobbyManager, LobbySettings};
use crate::network::protocol::{ClientMessage, ErrorCode, ServerMessage, PROTOCOL_VERSION};
use crate::network::room::{GameRoom, RoomConfig, RoomError, SeatGrant};
use crate::network::security::{BanList, InviteLimiter, RateLimits, SecurityError, SessionGuard, Traffic};
use crate::replay::format::ReplayMeta;
use crate::replay::recorder::Recorder;

/// Longest accepted player name.
pub const MAX_PLAYER_NAME: usize = 32;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Host written into invites.
    pub public_host: String,
    /// Port written into invites.
    pub public_port: u16,
    /// Per-session rate limits.
    pub limits: RateLimits,
    /// Per-client outgoing queue.
    pub outbox_capacity: usize,
    /// Server ping cadence.
    pub ping_interval: Duration,
    /// Silence before a connection is dropped.
    pub idle_timeout: Duration,
    /// Empty lobby and abandoned room retention, seconds.
    pub linger_secs: f64,
    /// Invite signing secret.
    pub invite_secret: Vec<u8>,
    /// Default invite lifetime, seconds.
    pub invite_ttl: u64,
    /// Escalation ban length, seconds.
    pub ban_secs: f64,
    /// Ban list file; in-memory when unset.
    pub banlist_path: Option<PathBuf>,
    /// Replay directory; no recording when unset.
    pub replay_dir: Option<PathBuf>,
    /// Replay signing key.
    pub replay_key: Option<Vec<u8>>,
    /// Server version string.
    pub version: String,
}

impl ServerConfig {
    /// Config from runtime settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bind_addr: settings.bind_addr,
            public_host: settings.public_host.clone(),
            public_port: settings.bind_addr.port(),
            limits: settings.rate_limits(),
            outbox_capacity: settings.outbox_capacity,
            ping_interval: settings.ping_interval(),
            idle_timeout: settings.idle_timeout(),
            linger_secs: settings.lobby_linger_secs as f64,
            invite_secret: settings.invite_secret.clone().into_bytes(),
            invite_ttl: settings.invite_ttl_secs,
            ban_secs: settings.ban_seconds as f64,
            banlist_path: Some(settings.banlist_path.clone()),
            replay_dir: settings.replay_dir.clone(),
            replay_key: settings.replay_hmac_key.clone().map(String::into_bytes),
            version: crate::VERSION.to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            banlist_path: None,
            ..Self::from_settings(&Settings::default())
        }
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Ban list could not be loaded.
    #[error("ban list: {0}")]
    BanList(#[from] SecurityError),
}

type SessionId = String;

enum HubCommand {
    Connect {
        session: SessionId,
        ip: IpAddr,
        outbox: Outbox<ServerMessage>,
        reply: oneshot::Sender<bool>,
    },
    Message {
        session: SessionId,
        msg: ClientMessage,
    },
    Rtt {
        session: SessionId,
        rtt: f64,
    },
    Ban {
        session: SessionId,
    },
    Disconnect {
        session: SessionId,
    },
    Sweep,
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

// =============================================================================
// HUB
// =============================================================================

struct Session {
    ip: IpAddr,
    name: Option<String>,
    outbox: Outbox<ServerMessage>,
    room: Option<String>,
    spectating: Option<String>,
}

/// Single owner of lobbies, rooms, invites and bans.
struct Hub {
    config: Arc<ServerConfig>,
    clock: SharedClock,
    sessions: HashMap<SessionId, Session>,
    lobbies: LobbyManager,
    rooms: HashMap<String, GameRoom>,
    abandoned: HashMap<String, f64>,
    invites: InviteBook,
    invite_limiter: InviteLimiter,
    bans: BanList,
    players: Arc<watch::Sender<u32>>,
}

fn lobby_error(e: LobbyError) -> ServerMessage {
    ServerMessage::error(ErrorCode::LobbyError, e.to_string())
}

fn room_error(e: RoomError) -> ServerMessage {
    let code = match e {
        RoomError::BadSequence { .. } => ErrorCode::BadSequence,
        RoomError::BadToken(_) | RoomError::UnknownPlayer(_) => ErrorCode::RejoinRejected,
        RoomError::InvalidAction(_) | RoomError::NotYourTurn { .. } | RoomError::IllegalMove(_) | RoomError::NotStarted => {
            ErrorCode::ActionRejected
        }
        _ => ErrorCode::LobbyError,
    };
    ServerMessage::error(code, e.to_string())
}

impl Hub {
    fn new(config: Arc<ServerConfig>, clock: SharedClock, bans: BanList, players: Arc<watch::Sender<u32>>) -> Self {
        Self {
            lobbies: LobbyManager::new(config.linger_secs),
            invites: InviteBook::new(clock.clone()),
            invite_limiter: InviteLimiter::new(),
            sessions: HashMap::new(),
            rooms: HashMap::new(),
            abandoned: HashMap::new(),
            config,
            clock,
            bans,
            players,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = rx.recv().await {
            if let HubCommand::Shutdown { done } = cmd {
                self.finish();
                let _ = done.send(());
                return;
            }
            self.handle(cmd);
        }
        self.finish();
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Connect {
                session,
                ip,
                outbox,
                reply,
            } => {
                let admitted = !self.bans.is_banned(ip);
                if admitted {
                    self.sessions.insert(
                        session,
                        Session {
                            ip,
                            name: None,
                            outbox,
                            room: None,
                            spectating: None,
                        },
                    );
                } else {
                    info!(%ip, "refused banned address");
                }
                let _ = reply.send(admitted);
            }
            HubCommand::Message { session, msg } => self.on_message(&session, msg),
            HubCommand::Rtt { session, rtt } => {
                if let Some((name, room)) = self.member(&session) {
                    if let Ok(lobby) = self.lobbies.get_mut(&room) {
                        lobby.record_rtt(&name, rtt);
                    }
                }
            }
            HubCommand::Ban { session } => {
                if let Some(s) = self.sessions.get(&session) {
                    let ip = s.ip;
                    if let Err(e) = self.bans.ban(ip, Some(self.config.ban_secs), "rate limit escalation") {
                        error!(%ip, error = %e, "failed to persist ban");
                    }
                }
            }
            HubCommand::Disconnect { session } => self.on_disconnect(&session),
            HubCommand::Sweep => self.sweep(),
            HubCommand::Shutdown { .. } => {}
        }
        self.publish_player_count();
    }

    fn send(&self, session: &str, msg: ServerMessage) {
        if let Some(s) = self.sessions.get(session) {
            s.outbox.push(msg);
        }
    }

    fn broadcast(&self, room: &str, msg: &ServerMessage) {
        for s in self.sessions.values() {
            if s.room.as_deref() == Some(room) || s.spectating.as_deref() == Some(room) {
                s.outbox.push(msg.clone());
            }
        }
    }

    fn broadcast_lobby(&self, room: &str) {
        if let Ok(lobby) = self.lobbies.get(room) {
            self.broadcast(room, &ServerMessage::LobbyUpdate(lobby.status()));
        }
    }

    fn member(&self, session: &str) -> Option<(String, String)> {
        let s = self.sessions.get(session)?;
        Some((s.name.clone()?, s.room.clone()?))
    }

    fn publish_player_count(&self) {
        let count = self.sessions.values().filter(|s| s.room.is_some()).count();
        self.players.send_if_modified(|current| {
            let next = u32::try_from(count).unwrap_or(u32::MAX);
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    fn on_message(&mut self, session: &str, msg: ClientMessage) {
        let Some(s) = self.sessions.get(session) else {
            return;
        };
        let name = s.name.clone();

        let msg = match msg {
            ClientMessage::Hello { name, build } => {
                self.on_hello(session, name, build);
                return;
            }
            ClientMessage::LobbyList => {
                self.send(
                    session,
                    ServerMessage::LobbyList {
                        lobbies: self.lobbies.list(),
                    },
                );
                return;
            }
            ClientMessage::Ping { ts } => {
                self.send(session, ServerMessage::Pong { ts });
                return;
            }
            ClientMessage::Pong { .. } => return,
            other => other,
        };
        let Some(name) = name else {
            self.send(session, ServerMessage::error(ErrorCode::NotIdentified, "send HELLO first"));
            return;
        };

        match msg {
            ClientMessage::LobbyCreate(settings) => self.on_create(session, &name, settings),
            ClientMessage::LobbyJoin { lobby } => self.on_join(session, &name, &lobby),
            ClientMessage::LobbyLeave => self.detach(session),
            ClientMessage::LobbyReady { ready } => self.on_ready(session, &name, ready),
            ClientMessage::LobbySpectate { lobby } => self.on_spectate(session, &name, &lobby),
            ClientMessage::LobbyStart => self.on_start(session),
            ClientMessage::Action { fields } => self.on_action(session, &name, &fields),
            ClientMessage::State => self.on_state(session),
            ClientMessage::InviteCreate { ttl } => self.on_invite_create(session, ttl),
            ClientMessage::InviteJoin { invite } => self.on_invite_join(session, &name, &invite),
            ClientMessage::InviteRefresh { code } => self.on_invite_refresh(session, &code),
            ClientMessage::InviteRevoke { code } => self.on_invite_revoke(session, &code),
            ClientMessage::Rejoin { lobby, token } => self.on_rejoin(session, &name, &lobby, &token),
            ClientMessage::Hello { .. } | ClientMessage::LobbyList | ClientMessage::Ping { .. } | ClientMessage::Pong { .. } => {}
        }
    }

    fn on_hello(&mut self, session: &str, name: String, build: Option<String>) {
        let name = name.trim().to_string();
        if name.is_empty() || name.chars().count() > MAX_PLAYER_NAME {
            self.send(session, ServerMessage::error(ErrorCode::InvalidMessage, "bad player name"));
            return;
        }
        let Some(s) = self.sessions.get_mut(session) else {
            return;
        };
        if s.room.is_some() {
            s.outbox.push(ServerMessage::error(ErrorCode::InvalidMessage, "cannot rename inside a lobby"));
            return;
        }
        debug!(session, player = %name, build = ?build, "hello");
        s.name = Some(name);
        let reply = ServerMessage::Hello {
            session: session.to_string(),
            server: self.config.version.clone(),
            protocol: PROTOCOL_VERSION,
        };
        s.outbox.push(reply);
    }

    fn in_room(&self, session: &str) -> bool {
        self.sessions.get(session).is_some_and(|s| s.room.is_some())
    }

    fn seat(&mut self, session: &str, room: &str, grant: SeatGrant) {
        if let Some(s) = self.sessions.get_mut(session) {
            s.room = Some(room.to_string());
            s.spectating = None;
        }
        self.abandoned.remove(room);
        self.send(
            session,
            ServerMessage::Seat {
                lobby: room.to_string(),
                slot: grant.slot,
                token: grant.token,
            },
        );
    }

    fn on_create(&mut self, session: &str, name: &str, settings: LobbySettings) {
        if self.in_room(session) {
            self.send(session, ServerMessage::error(ErrorCode::LobbyError, "already in a lobby"));
            return;
        }
        let seed: u64 = rand::thread_rng().gen();
        let room_config = RoomConfig::for_lobby(&settings);
        let id = match self.lobbies.create(settings, seed) {
            Ok(lobby) => {
                if let Err(e) = lobby.join(name) {
                    let id = lobby.id().to_string();
                    self.lobbies.remove(&id);
                    self.send(session, lobby_error(e));
                    return;
                }
                lobby.id().to_string()
            }
            Err(e) => {
                self.send(session, lobby_error(e));
                return;
            }
        };

        let mut room = GameRoom::new(id.clone(), seed, room_config);
        match room.add_player(name) {
            Ok(grant) => {
                self.rooms.insert(id.clone(), room);
                self.seat(session, &id, grant);
                self.broadcast_lobby(&id);
            }
            Err(e) => {
                self.lobbies.remove(&id);
                self.send(session, room_error(e));
            }
        }
    }

    fn on_join(&mut self, session: &str, name: &str, room_id: &str) {
        if self.in_room(session) {
            self.send(session, ServerMessage::error(ErrorCode::LobbyError, "already in a lobby"));
            return;
        }
        let Some(room) = self.rooms.get_mut(room_id) else {
            self.send(session, lobby_error(LobbyError::NotFound(room_id.to_string())));
            return;
        };

        if let Ok(lobby) = self.lobbies.get_mut(room_id) {
            if let Err(e) = lobby.join(name) {
                self.send(session, lobby_error(e));
                return;
            }
            match room.add_player(name) {
                Ok(grant) => {
                    self.seat(session, room_id, grant);
                    self.broadcast_lobby(room_id);
                }
                Err(e) => {
                    let _ = lobby.leave(name);
                    self.send(session, room_error(e));
                }
            }
            return;
        }

        match room.add_player(name) {
            Ok(grant) => {
                let snapshot = ServerMessage::State(room.snapshot());
                info!(room = room_id, player = name, "drop-in join");
                self.seat(session, room_id, grant);
                self.broadcast(room_id, &snapshot);
            }
            Err(e) => self.send(session, room_error(e)),
        }
    }

    fn detach(&mut self, session: &str) {
        let Some(s) = self.sessions.get_mut(session) else {
            return;
        };
        let name = s.name.clone().unwrap_or_default();
        if let Some(spectated) = s.spectating.take() {
            if let Some(room) = self.rooms.get_mut(&spectated) {
                room.remove_spectator(&name);
            }
        }
        let Some(room_id) = s.room.take() else {
            return;
        };
        if let Ok(lobby) = self.lobbies.get_mut(&room_id) {
            let _ = lobby.leave(&name);
        }
        if let Some(room) = self.rooms.get_mut(&room_id) {
            let _ = room.drop_player(&name);
        }
        self.broadcast_lobby(&room_id);
    }

    fn on_disconnect(&mut self, session: &str) {
        self.detach(session);
        if let Some(s) = self.sessions.remove(session) {
            debug!(session, ip = %s.ip, "session closed");
        }
    }

    fn on_ready(&mut self, session: &str, name: &str, ready: bool) {
        let Some((_, room_id)) = self.member(session) else {
            self.send(session, ServerMessage::error(ErrorCode::LobbyError, "not in a lobby"));
            return;
        };
        match self.lobbies.get_mut(&room_id) {
            Ok(lobby) => match lobby.set_ready(name, ready) {
                Ok(()) => self.broadcast_lobby(&room_id),
                Err(e) => self.send(session, lobby_error(e)),
            },
            Err(e) => self.send(session, lobby_error(e)),
        }
    }

    fn on_spectate(&mut self, session: &str, name: &str, room_id: &str) {
        if self.in_room(session) {
            self.send(session, ServerMessage::error(ErrorCode::LobbyError, "players cannot spectate"));
            return;
        }
        let Some(room) = self.rooms.get_mut(room_id) else {
            self.send(session, lobby_error(LobbyError::NotFound(room_id.to_string())));
            return;
        };
        match room.add_spectator(name) {
            Ok(()) => {
                let snapshot = room.snapshot();
                if let Some(s) = self.sessions.get_mut(session) {
                    s.spectating = Some(room_id.to_string());
                }
                self.send(session, ServerMessage::State(snapshot));
            }
            Err(e) => self.send(session, room_error(e)),
        }
    }

    fn on_start(&mut self, session: &str) {
        let Some((_, room_id)) = self.member(session) else {
            self.send(session, ServerMessage::error(ErrorCode::LobbyError, "not in a lobby"));
            return;
        };
        let (Ok(lobby), Some(room)) = (self.lobbies.get(&room_id), self.rooms.get_mut(&room_id)) else {
            self.send(session, room_error(RoomError::AlreadyStarted));
            return;
        };
        if !lobby.all_ready() {
            self.send(session, room_error(RoomError::NotReady));
            return;
        }

        if let Some(dir) = &self.config.replay_dir {
            let path = dir.join(format!("{}-{}.jsonl", room_id, room.seed()));
            let meta = ReplayMeta {
                seed: room.seed(),
                mode: GameMode::Online,
                map_id: room_id.clone(),
            };
            match Recorder::start(path, &meta, self.config.replay_key.as_deref()) {
                Ok(recorder) => room.attach_recorder(recorder),
                Err(e) => warn!(room = %room_id, error = %e, "replay recording disabled"),
            }
        }

        match room.start(lobby) {
            Ok(()) => {
                let snapshot = ServerMessage::State(room.snapshot());
                self.lobbies.remove(&room_id);
                self.broadcast(&room_id, &snapshot);
            }
            Err(e) => self.send(session, room_error(e)),
        }
    }

    fn on_action(&mut self, session: &str, name: &str, fields: &Map<String, Value>) {
        let Some((_, room_id)) = self.member(session) else {
            self.send(session, ServerMessage::error(ErrorCode::ActionRejected, "not in a match"));
            return;
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        let Some(slot) = room.slot_of(name) else {
            return;
        };
        match room.apply_action(fields, slot) {
            Ok(entry) => {
                let applied = ServerMessage::Action {
                    seq: entry.seq,
                    tick: entry.tick,
                    slot: entry.slot,
                    action: entry.action,
                };
                self.broadcast(&room_id, &applied);
            }
            Err(e) => {
                debug!(room = %room_id, player = name, error = %e, "action rejected");
                self.send(session, room_error(e));
            }
        }
    }

    fn on_state(&self, session: &str) {
        let room_id = self
            .sessions
            .get(session)
            .and_then(|s| s.room.clone().or_else(|| s.spectating.clone()));
        match room_id.as_deref().and_then(|id| self.rooms.get(id)) {
            Some(room) => self.send(session, ServerMessage::State(room.snapshot())),
            None => self.send(session, ServerMessage::error(ErrorCode::LobbyError, "not in a lobby")),
        }
    }

    fn on_invite_create(&mut self, session: &str, ttl: Option<u64>) {
        let Some(s) = self.sessions.get(session) else {
            return;
        };
        let (ip, room) = (s.ip, s.room.clone());
        let Some(room) = room else {
            self.send(session, ServerMessage::error(ErrorCode::LobbyError, "not in a lobby"));
            return;
        };
        if !self.invite_limiter.allow(ip) {
            self.send(session, ServerMessage::error(ErrorCode::RateLimited, "too many invites"));
            return;
        }
        let ttl = ttl.unwrap_or(self.config.invite_ttl).clamp(1, self.config.invite_ttl.max(1));
        let invite = self.invites.create(
            &self.config.public_host,
            self.config.public_port,
            &room,
            &self.config.invite_secret,
            ttl,
        );
        let url = invite.to_url();
        self.send(session, ServerMessage::Invite { invite, url });
    }

    fn on_invite_join(&mut self, session: &str, name: &str, invite: &Invite) {
        if let Err(e) = self.invites.validate(invite, &self.config.invite_secret) {
            warn!(session, code = %invite.code, error = %e, "invite rejected");
            self.send(session, ServerMessage::error(ErrorCode::InviteRejected, e.to_string()));
            return;
        }
        self.on_join(session, name, &invite.room);
    }

    fn owns_invite(&self, session: &str, code: &str) -> bool {
        let room = self.sessions.get(session).and_then(|s| s.room.as_deref());
        match (self.invites.get(code), room) {
            (Some(invite), Some(room)) => invite.room == room,
            _ => false,
        }
    }

    fn on_invite_refresh(&mut self, session: &str, code: &str) {
        if !self.owns_invite(session, code) {
            self.send(session, ServerMessage::error(ErrorCode::InviteRejected, "not your invite"));
            return;
        }
        match self.invites.refresh(code, &self.config.invite_secret, self.config.invite_ttl) {
            Ok(invite) => {
                let url = invite.to_url();
                self.send(session, ServerMessage::Invite { invite, url });
            }
            Err(e) => self.send(session, ServerMessage::error(ErrorCode::InviteRejected, e.to_string())),
        }
    }

    fn on_invite_revoke(&mut self, session: &str, code: &str) {
        if !self.owns_invite(session, code) {
            self.send(session, ServerMessage::error(ErrorCode::InviteRejected, "not your invite"));
            return;
        }
        self.invites.revoke(code);
    }

    fn on_rejoin(&mut self, session: &str, name: &str, room_id: &str, token: &str) {
        if self.in_room(session) {
            self.send(session, ServerMessage::error(ErrorCode::RejoinRejected, "already in a lobby"));
            return;
        }
        let Some(room) = self.rooms.get_mut(room_id) else {
            self.send(session, ServerMessage::error(ErrorCode::RejoinRejected, "no such room"));
            return;
        };
        // before the match starts the seat has to be won back in the lobby too
        let mut reseated = false;
        if let Ok(lobby) = self.lobbies.get_mut(room_id) {
            if !lobby.contains(name) {
                if let Err(e) = lobby.join(name) {
                    debug!(session, room = room_id, player = name, error = %e, "rejoin refused");
                    self.send(session, ServerMessage::error(ErrorCode::RejoinRejected, e.to_string()));
                    return;
                }
                reseated = true;
            }
        }
        match room.rejoin_player(name, token) {
            Ok((slot, state)) => {
                if let Some(s) = self.sessions.get_mut(session) {
                    s.room = Some(room_id.to_string());
                    s.spectating = None;
                }
                self.abandoned.remove(room_id);
                self.send(
                    session,
                    ServerMessage::Rejoin {
                        lobby: room_id.to_string(),
                        slot,
                        state,
                    },
                );
                self.broadcast_lobby(room_id);
            }
            Err(e) => {
                if reseated {
                    if let Ok(lobby) = self.lobbies.get_mut(room_id) {
                        let _ = lobby.leave(name);
                    }
                }
                self.send(session, room_error(e));
            }
        }
    }

    fn sweep(&mut self) {
        let now = self.clock.now();
        for id in self.lobbies.sweep(now) {
            if let Some(mut room) = self.rooms.remove(&id) {
                Self::close_room(&id, &mut room);
            }
        }

        let linger = self.config.linger_secs;
        let mut expired = Vec::new();
        for (id, room) in &self.rooms {
            if !room.is_started() {
                continue;
            }
            if room.active_roster().is_empty() && room.spectators().is_empty() {
                let since = *self.abandoned.entry(id.clone()).or_insert(now);
                if now - since > linger {
                    expired.push(id.clone());
                }
            } else {
                self.abandoned.remove(id);
            }
        }
        for id in expired {
            self.abandoned.remove(&id);
            if let Some(mut room) = self.rooms.remove(&id) {
                Self::close_room(&id, &mut room);
            }
        }

        self.invites.purge_expired();
        self.bans.purge_expired();
    }

    fn close_room(id: &str, room: &mut GameRoom) {
        if let Some(result) = room.stop_recording(None) {
            match result {
                Ok(path) => info!(room = id, path = %path.display(), "replay saved"),
                Err(e) => warn!(room = id, error = %e, "replay finalize failed"),
            }
        }
        info!(room = id, tick = room.tick(), "room closed");
    }

    fn finish(&mut self) {
        for (id, room) in self.rooms.iter_mut() {
            Self::close_room(id, room);
        }
        self.rooms.clear();
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// The game server.
pub struct GameServer {
    config: Arc<ServerConfig>,
    clock: SharedClock,
    shutdown_tx: broadcast::Sender<()>,
    players: Arc<watch::Sender<u32>>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, clock: SharedClock) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (players, _) = watch::channel(0);
        Self {
            config: Arc::new(config),
            clock,
            shutdown_tx,
            players: Arc::new(players),
        }
    }

    /// Live count of seated players, for the master announcer.
    pub fn player_count(&self) -> watch::Receiver<u32> {
        self.players.subscribe()
    }

    /// Shutdown notifications, for companion tasks.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    #[instrument(skip_all)]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let bans = match &self.config.banlist_path {
            Some(path) => BanList::load(path, self.clock.clone())?,
            None => BanList::in_memory(self.clock.clone()),
        };
        info!(addr = ?listener.local_addr().ok(), bans = bans.len(), "game server listening");

        let (hub_tx, hub_rx) = mpsc::channel(1024);
        let hub = Hub::new(self.config.clone(), self.clock.clone(), bans, self.players.clone());
        let hub_handle = tokio::spawn(hub.run(hub_rx));

        let sweep_tx = hub_tx.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if sweep_tx.send(HubCommand::Sweep).await.is_err() {
                    break;
                }
            }
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(%addr, "new connection");
                            tokio::spawn(Self::handle_connection(
                                stream,
                                addr,
                                hub_tx.clone(),
                                self.config.clone(),
                                self.clock.clone(),
                                self.shutdown_tx.subscribe(),
                            ));
                        }
                        Err(e) => error!(error = %e, "accept error"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        sweep_handle.abort();
        let (done_tx, done_rx) = oneshot::channel();
        if hub_tx.send(HubCommand::Shutdown { done: done_tx }).await.is_ok() {
            let _ = done_rx.await;
        }
        hub_handle.abort();
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: mpsc::Sender<HubCommand>,
        config: Arc<ServerConfig>,
        clock: SharedClock,
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
        let (outbox, mut out_rx) = Outbox::<ServerMessage>::channel(config.outbox_capacity);
        let session: SessionId = Uuid::new_v4().simple().to_string();

        let (reply_tx, reply_rx) = oneshot::channel();
        let connect = HubCommand::Connect {
            session: session.clone(),
            ip: addr.ip(),
            outbox: outbox.clone(),
            reply: reply_tx,
        };
        if hub.send(connect).await.is_err() || !reply_rx.await.unwrap_or(false) {
            if let Ok(text) = encode(&ServerMessage::error(ErrorCode::RateLimited, "banned")) {
                let _ = ws_sender.send(Message::Text(text)).await;
            }
            let _ = ws_sender.close().await;
            return;
        }

        let sender_task = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match encode(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        error!(error = %e, "failed to encode message");
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let mut guard = SessionGuard::new(config.limits);
        let mut rtt = RttTracker::default();
        let mut ticker = interval(config.ping_interval);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    // binary frames are charged like text and then refused
                    let (size, decoded) = match frame {
                        Some(Ok(Message::Text(text))) => (text.len(), Some(decode::<ClientMessage>(&text))),
                        Some(Ok(Message::Binary(data))) => (data.len(), None),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(%addr, error = %e, "websocket error");
                            break;
                        }
                        Some(Ok(_)) => {
                            last_seen = Instant::now();
                            continue;
                        }
                    };
                    last_seen = Instant::now();

                    let kind = match &decoded {
                        Some(Ok(ClientMessage::Action { .. })) => Traffic::Action,
                        Some(Ok(ClientMessage::Ping { .. })) => Traffic::Ping,
                        _ => Traffic::Other,
                    };
                    if let Err(e) = guard.admit(kind, size) {
                        warn!(%addr, %session, error = %e, strikes = guard.strikes(), "message dropped");
                        outbox.push(ServerMessage::error(ErrorCode::RateLimited, e.to_string()));
                        if guard.should_escalate() {
                            warn!(%addr, %session, "rate limit escalation, closing connection");
                            let _ = hub.send(HubCommand::Ban { session: session.clone() }).await;
                            break;
                        }
                        continue;
                    }

                    let Some(decoded) = decoded else {
                        outbox.push(ServerMessage::error(ErrorCode::InvalidMessage, "binary frames are not supported"));
                        continue;
                    };
                    match decoded {
                        Ok(ClientMessage::Ping { ts }) => {
                            outbox.push(ServerMessage::Pong { ts });
                        }
                        Ok(ClientMessage::Pong { ts }) => {
                            let sample = rtt.sample((clock.now() - ts).max(0.0));
                            let _ = hub.send(HubCommand::Rtt { session: session.clone(), rtt: sample }).await;
                        }
                        Ok(msg) => {
                            if hub.send(HubCommand::Message { session: session.clone(), msg }).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(%addr, error = %e, "rejected message");
                            outbox.push(ServerMessage::error(ErrorCode::from(&e), e.to_string()));
                        }
                    }
                }
                _ = ticker.tick() => {
                    if last_seen.elapsed() > config.idle_timeout {
                        info!(%addr, %session, "idle timeout");
                        break;
                    }
                    outbox.push(ServerMessage::Ping { ts: clock.now() });
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        let _ = hub.send(HubCommand::Disconnect { session: session.clone() }).await;
        drop(outbox);
        sender_task.abort();
        debug!(%addr, %session, "connection cleaned up");
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::{system_clock, ManualClock};
    use crate::network::client::{ClientConfig, NetClient};
    use serde_json::json;

    struct TestHub {
        hub: Hub,
        inboxes: HashMap<String, mpsc::Receiver<ServerMessage>>,
    }

    impl TestHub {
        fn new(clock: SharedClock) -> Self {
            let config = Arc::new(ServerConfig::default());
            let bans = BanList::in_memory(clock.clone());
            let (players, _) = watch::channel(0);
            Self {
                hub: Hub::new(config, clock, bans, Arc::new(players)),
                inboxes: HashMap::new(),
            }
        }

        fn connect(&mut self, session: &str, name: &str) {
            let (outbox, rx) = Outbox::channel(64);
            let (reply, _) = oneshot::channel();
            self.hub.handle(HubCommand::Connect {
                session: session.into(),
                ip: IpAddr::from([127, 0, 0, 1]),
                outbox,
                reply,
            });
            self.inboxes.insert(session.into(), rx);
            self.send(session, ClientMessage::Hello { name: name.into(), build: None });
            assert!(matches!(self.drain(session).first(), Some(ServerMessage::Hello { .. })));
        }

        fn send(&mut self, session: &str, msg: ClientMessage) {
            self.hub.handle(HubCommand::Message {
                session: session.into(),
                msg,
            });
        }

        fn drain(&mut self, session: &str) -> Vec<ServerMessage> {
            let rx = self.inboxes.get_mut(session).unwrap();
            let mut out = Vec::new();
            while let Ok(msg) = rx.try_recv() {
                out.push(msg);
            }
            out
        }
    }

    fn action(v: Value) -> ClientMessage {
        match v {
            Value::Object(fields) => ClientMessage::Action { fields },
            _ => panic!("not an object"),
        }
    }

    fn seat_token(msgs: &[ServerMessage]) -> String {
        msgs.iter()
            .find_map(|m| match m {
                ServerMessage::Seat { token, .. } => Some(token.clone()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_requires_hello() {
        let mut t = TestHub::new(system_clock());
        let (outbox, rx) = Outbox::channel(8);
        let (reply, _) = oneshot::channel();
        t.hub.handle(HubCommand::Connect {
            session: "s".into(),
            ip: IpAddr::from([127, 0, 0, 1]),
            outbox,
            reply,
        });
        t.inboxes.insert("s".into(), rx);
        t.send("s", ClientMessage::LobbyStart);
        match t.drain("s").as_slice() {
            [ServerMessage::Error(err)] => assert_eq!(err.code, ErrorCode::NotIdentified),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_match_flow_through_hub() {
        let mut t = TestHub::new(system_clock());
        t.connect("a", "ann");
        t.connect("b", "bob");

        t.send("a", ClientMessage::LobbyCreate(LobbySettings::named("den")));
        let token_a = seat_token(&t.drain("a"));
        assert!(!token_a.is_empty());
        t.send("b", ClientMessage::LobbyJoin { lobby: "1".into() });
        let token_b = seat_token(&t.drain("b"));

        t.send("a", ClientMessage::LobbyStart);
        assert!(t
            .drain("a")
            .iter()
            .any(|m| matches!(m, ServerMessage::Error(e) if e.code == ErrorCode::LobbyError)));

        t.send("a", ClientMessage::LobbyReady { ready: true });
        t.send("b", ClientMessage::LobbyReady { ready: true });
        t.send("a", ClientMessage::LobbyStart);
        assert!(t.drain("b").iter().any(|m| matches!(m, ServerMessage::State(s) if s.started)));
        t.drain("a");
        assert!(t.hub.lobbies.is_empty());

        t.send("a", action(json!({"seq": 1, "end_turn": true})));
        assert!(matches!(t.drain("b").as_slice(), [ServerMessage::Action { seq: 1, slot: 0, .. }]));
        t.drain("a");

        t.send("a", action(json!({"seq": 1, "end_turn": true})));
        match t.drain("a").as_slice() {
            [ServerMessage::Error(err)] => assert_eq!(err.code, ErrorCode::BadSequence),
            other => panic!("unexpected {other:?}"),
        }

        t.hub.handle(HubCommand::Disconnect { session: "b".into() });
        t.connect("b2", "bob");
        t.send("b2", ClientMessage::Rejoin { lobby: "1".into(), token: "wrong".into() });
        assert!(matches!(t.drain("b2").as_slice(), [ServerMessage::Error(e)] if e.code == ErrorCode::RejoinRejected));
        t.send("b2", ClientMessage::Rejoin { lobby: "1".into(), token: token_b });
        match t.drain("b2").as_slice() {
            [ServerMessage::Rejoin { slot, state, .. }] => {
                assert_eq!(*slot, 1);
                assert_eq!(state.next_seq, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rejoin_refused_when_lobby_refilled() {
        let mut t = TestHub::new(system_clock());
        for (session, name) in [("a", "ann"), ("b", "bob"), ("c", "cat")] {
            t.connect(session, name);
        }
        let mut settings = LobbySettings::named("pair");
        settings.max_players = 2;
        t.send("a", ClientMessage::LobbyCreate(settings));
        t.send("b", ClientMessage::LobbyJoin { lobby: "1".into() });
        let token = seat_token(&t.drain("b"));
        t.send("b", ClientMessage::LobbyLeave);
        t.send("c", ClientMessage::LobbyJoin { lobby: "1".into() });
        assert!(t.drain("c").iter().any(|m| matches!(m, ServerMessage::Seat { slot: 2, .. })));

        t.send("b", ClientMessage::Rejoin { lobby: "1".into(), token: token.clone() });
        assert!(matches!(t.drain("b").as_slice(), [ServerMessage::Error(e)] if e.code == ErrorCode::RejoinRejected));
        assert_eq!(t.hub.lobbies.get("1").unwrap().players(), ["ann".to_string(), "cat".to_string()]);
        assert!(t.hub.sessions["b"].room.is_none());
        assert!(!t.hub.rooms["1"].active_roster().contains(&"bob"));

        t.send("c", ClientMessage::LobbyLeave);
        t.send("b", ClientMessage::Rejoin { lobby: "1".into(), token: "wrong".into() });
        assert!(matches!(t.drain("b").as_slice(), [ServerMessage::Error(e)] if e.code == ErrorCode::RejoinRejected));
        assert_eq!(t.hub.lobbies.get("1").unwrap().players(), ["ann".to_string()]);

        t.send("b", ClientMessage::Rejoin { lobby: "1".into(), token });
        assert!(matches!(t.drain("b").first(), Some(ServerMessage::Rejoin { slot: 1, .. })));
        assert_eq!(t.hub.lobbies.get("1").unwrap().players(), ["ann".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_invite_flow_through_hub() {
        let mut t = TestHub::new(system_clock());
        for (session, name) in [("a", "ann"), ("b", "bob"), ("c", "cat"), ("d", "dan")] {
            t.connect(session, name);
        }
        let mut private = LobbySettings::named("hidden");
        private.private = true;
        t.send("a", ClientMessage::LobbyCreate(private));
        t.drain("a");

        t.send("b", ClientMessage::LobbyList);
        assert!(matches!(t.drain("b").as_slice(), [ServerMessage::LobbyList { lobbies }] if lobbies.is_empty()));

        t.send("a", ClientMessage::InviteCreate { ttl: Some(60) });
        let first = match t.drain("a").as_slice() {
            [ServerMessage::Invite { invite, url }] => {
                assert_eq!(&Invite::from_url(url).unwrap(), invite);
                invite.clone()
            }
            other => panic!("unexpected {other:?}"),
        };

        t.send("a", ClientMessage::InviteRefresh { code: first.code.clone() });
        let refreshed = match t.drain("a").as_slice() {
            [ServerMessage::Invite { invite, .. }] => invite.clone(),
            other => panic!("unexpected {other:?}"),
        };
        assert!(refreshed.exp > first.exp);

        t.send("b", ClientMessage::InviteJoin { invite: first });
        assert!(matches!(t.drain("b").as_slice(), [ServerMessage::Error(e)] if e.code == ErrorCode::InviteRejected));

        t.send("c", ClientMessage::InviteJoin { invite: refreshed.clone() });
        assert!(t.drain("c").iter().any(|m| matches!(m, ServerMessage::Seat { slot: 1, .. })));

        t.send("b", ClientMessage::InviteRevoke { code: refreshed.code.clone() });
        assert!(matches!(t.drain("b").as_slice(), [ServerMessage::Error(e)] if e.code == ErrorCode::InviteRejected));

        t.send("a", ClientMessage::InviteRevoke { code: refreshed.code.clone() });
        t.send("d", ClientMessage::InviteJoin { invite: refreshed });
        assert!(matches!(t.drain("d").as_slice(), [ServerMessage::Error(e)] if e.code == ErrorCode::InviteRejected));
    }

    #[test]
    fn test_disconnect_keeps_lobby_until_linger() {
        let clock = ManualClock::new(1_000.0);
        let mut t = TestHub::new(clock.clone());
        t.connect("a", "ann");
        t.send("a", ClientMessage::LobbyCreate(LobbySettings::named("den")));
        t.hub.handle(HubCommand::Disconnect { session: "a".into() });

        t.hub.handle(HubCommand::Sweep);
        assert_eq!(t.hub.lobbies.len(), 1);
        clock.advance(t.hub.config.linger_secs + 1.0);
        t.hub.handle(HubCommand::Sweep);
        assert!(t.hub.lobbies.is_empty());
        assert!(t.hub.rooms.is_empty());
    }

    async fn next_matching<F>(client: &mut NetClient, mut pred: F) -> ServerMessage
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.recv())
                .await
                .expect("timed out")
                .expect("connection closed");
            if pred(&msg) {
                return msg;
            }
        }
    }

    #[tokio::test]
    async fn test_binary_flood_escalates_to_ban() {
        use tokio_tungstenite::connect_async;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let config = ServerConfig {
            limits: RateLimits {
                bytes_per_min: 16,
                max_strikes: 3,
                ..RateLimits::default()
            },
            ..ServerConfig::default()
        };
        let server = Arc::new(GameServer::new(config, system_clock()));
        let running = server.clone();
        let task = tokio::spawn(async move { running.serve(listener).await });

        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        for _ in 0..3 {
            ws.send(Message::Binary(vec![0u8; 64])).await.unwrap();
        }
        loop {
            match tokio::time::timeout(Duration::from_secs(5), ws.next()).await.expect("timed out") {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ServerMessage::Error(err)) = decode::<ServerMessage>(&text) {
                        assert_eq!(err.code, ErrorCode::RateLimited);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }

        let (mut again, _) = connect_async(url.as_str()).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), again.next())
            .await
            .expect("timed out");
        match first {
            Some(Ok(Message::Text(text))) => {
                let msg = decode::<ServerMessage>(&text).unwrap();
                assert!(matches!(msg, ServerMessage::Error(e) if e.message == "banned"));
            }
            other => panic!("unexpected {other:?}"),
        }

        server.shutdown();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = Arc::new(GameServer::new(ServerConfig::default(), system_clock()));
        let running = server.clone();
        let task = tokio::spawn(async move { running.serve(listener).await });

        let config = ClientConfig {
            ping_interval: Duration::from_secs(3600),
            ..ClientConfig::default()
        };
        let mut client = NetClient::connect(&url, &config).await.unwrap();

        client.send(ClientMessage::Hello { name: "ann".into(), build: None });
        next_matching(&mut client, |m| matches!(m, ServerMessage::Hello { .. })).await;

        client.send(ClientMessage::LobbyCreate(LobbySettings::named("den")));
        next_matching(&mut client, |m| matches!(m, ServerMessage::Seat { slot: 0, .. })).await;
        client.send(ClientMessage::LobbyReady { ready: true });
        client.send(ClientMessage::LobbyStart);
        next_matching(&mut client, |m| matches!(m, ServerMessage::State(s) if s.started)).await;

        client.send(action(json!({"seq": 1, "end_turn": true, "cheat": 1})));
        let err = next_matching(&mut client, |m| matches!(m, ServerMessage::Error(_))).await;
        assert!(matches!(err, ServerMessage::Error(e) if e.code == ErrorCode::ActionRejected));

        client.send(action(json!({"seq": 1, "end_turn": true})));
        next_matching(&mut client, |m| matches!(m, ServerMessage::Action { seq: 1, .. })).await;

        server.shutdown();
        let _ = task.await;
    }
}
