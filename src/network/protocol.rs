//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. Every
//! message is a JSON object `{"t": <TYPE>, "v": <version>, ...fields}`
//! carried in one text frame; see [`crate::network::codec`] for the
//! envelope checks applied before these types are decoded.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::game::action::Action;
use crate::network::codec::{ProtocolError, WireMessage};
use crate::network::invite::Invite;
use crate::network::lobby::{LobbySettings, LobbyStatus, LobbySummary};
use crate::network::room::RoomSnapshot;

/// Game protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Every game message type, in either direction.
pub const GAME_TYPES: &[&str] = &[
    "HELLO",
    "LOBBY_LIST",
    "LOBBY_CREATE",
    "LOBBY_JOIN",
    "LOBBY_LEAVE",
    "LOBBY_READY",
    "LOBBY_SPECTATE",
    "LOBBY_START",
    "LOBBY_UPDATE",
    "ACTION",
    "STATE",
    "PING",
    "PONG",
    "INVITE_CREATE",
    "INVITE_JOIN",
    "INVITE_REFRESH",
    "INVITE_REVOKE",
    "INVITE",
    "SEAT",
    "REJOIN",
    "ERROR",
];

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Introduce the session.
    Hello {
        /// Player name; unique per lobby.
        name: String,
        /// Client build.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        build: Option<String>,
    },

    /// Ask for public lobbies.
    LobbyList,

    /// Open a lobby and join it.
    LobbyCreate(LobbySettings),

    /// Join a lobby by id.
    LobbyJoin {
        /// Lobby id.
        lobby: String,
    },

    /// Leave the current lobby or match.
    LobbyLeave,

    /// Set the ready flag.
    LobbyReady {
        /// New flag.
        ready: bool,
    },

    /// Watch a lobby's match.
    LobbySpectate {
        /// Lobby id.
        lobby: String,
    },

    /// Start the match once everyone is ready.
    LobbyStart,

    /// A game action: `seq` plus one of `move` or `end_turn`. Kept as raw
    /// fields so the room can whitelist them.
    Action {
        /// Action fields.
        #[serde(flatten)]
        fields: Map<String, Value>,
    },

    /// Ask for a full snapshot.
    State,

    /// Latency probe; echoed as `PONG`.
    Ping {
        /// Sender clock, unix seconds.
        ts: f64,
    },

    /// Answer to a server `PING`.
    Pong {
        /// Timestamp from the `PING`.
        ts: f64,
    },

    /// Issue an invite to the current lobby.
    InviteCreate {
        /// Lifetime in seconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl: Option<u64>,
    },

    /// Join through an invite.
    InviteJoin {
        /// The invite as issued.
        invite: Invite,
    },

    /// Extend an invite, retiring its old signature.
    InviteRefresh {
        /// Join code.
        code: String,
    },

    /// Permanently disable an invite.
    InviteRevoke {
        /// Join code.
        code: String,
    },

    /// Reclaim a slot after a disconnect.
    Rejoin {
        /// Lobby id.
        lobby: String,
        /// Token from `SEAT`.
        token: String,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Session accepted.
    Hello {
        /// Session id.
        session: String,
        /// Server build.
        server: String,
        /// Protocol version.
        protocol: u32,
    },

    /// Public lobbies.
    LobbyList {
        /// Listing entries.
        lobbies: Vec<LobbySummary>,
    },

    /// Lobby membership or readiness changed.
    LobbyUpdate(LobbyStatus),

    /// Slot and rejoin token for the receiving player.
    Seat {
        /// Lobby id.
        lobby: String,
        /// Stable slot index.
        slot: usize,
        /// Rejoin credential.
        token: String,
    },

    /// An action was applied.
    Action {
        /// Sequence number.
        seq: u64,
        /// Room tick after applying.
        tick: u64,
        /// Acting slot.
        slot: usize,
        /// The action.
        action: Action,
    },

    /// Full room view.
    State(RoomSnapshot),

    /// Liveness probe; answer with `PONG`.
    Ping {
        /// Server clock, unix seconds.
        ts: f64,
    },

    /// Answer to a client `PING`.
    Pong {
        /// Timestamp from the `PING`.
        ts: f64,
    },

    /// An invite and its link.
    Invite {
        /// Signed invite.
        invite: Invite,
        /// `oko://join?...` link.
        url: String,
    },

    /// Rejoin succeeded.
    Rejoin {
        /// Lobby id.
        lobby: String,
        /// Reclaimed slot.
        slot: usize,
        /// Room view at the time of rejoin.
        state: RoomSnapshot,
    },

    /// Request refused.
    Error(ServerError),
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Not decodable or not a known message.
    InvalidMessage,
    /// Message over the size cap.
    TooLarge,
    /// Version mismatch.
    VersionMismatch,
    /// Rate limited.
    RateLimited,
    /// `HELLO` has not been sent.
    NotIdentified,
    /// Lobby operation failed.
    LobbyError,
    /// Action rejected by the room.
    ActionRejected,
    /// Out-of-sequence action.
    BadSequence,
    /// Invite rejected.
    InviteRejected,
    /// Rejoin rejected.
    RejoinRejected,
    /// Internal error.
    InternalError,
}

impl ServerMessage {
    /// Error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ServerError {
            code,
            message: message.into(),
        })
    }
}

impl From<&ProtocolError> for ErrorCode {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::TooLarge { .. } => ErrorCode::TooLarge,
            ProtocolError::VersionMismatch { .. } => ErrorCode::VersionMismatch,
            _ => ErrorCode::InvalidMessage,
        }
    }
}

impl WireMessage for ClientMessage {
    const VERSION: u32 = PROTOCOL_VERSION;
    const TYPES: &'static [&'static str] = GAME_TYPES;
}

impl WireMessage for ServerMessage {
    const VERSION: u32 = PROTOCOL_VERSION;
    const TYPES: &'static [&'static str] = GAME_TYPES;
}
