//! Network Layer
//!
//! WebSocket game server and client for real-time multiplayer.
//! This layer is **non-deterministic** - all game logic runs through `game/`.
//!
//! - [`codec`]: envelope checks shared by both wire protocols
//! - [`protocol`]: game message types
//! - [`lobby`]: pre-match gathering
//! - [`room`]: authoritative match rooms
//! - [`invite`]: signed join links
//! - [`security`]: rate limits, bans, payload checks
//! - [`client`]: reconnecting client with RTT tracking
//! - [`server`]: the game server

pub mod client;
pub mod codec;
pub mod invite;
pub mod lobby;
pub mod protocol;
pub mod room;
pub mod security;
pub mod server;

pub use client::{Backoff, ClientConfig, ClientError, NetClient, Outbox, RttTracker};
pub use codec::{decode, encode, ProtocolError, WireMessage, MAX_MESSAGE_SIZE};
pub use invite::{Invite, InviteBook, InviteError};
pub use lobby::{Lobby, LobbyError, LobbyManager, LobbySettings, LobbyStatus, LobbySummary};
pub use protocol::{ClientMessage, ErrorCode, ServerError, ServerMessage, PROTOCOL_VERSION};
pub use room::{GameRoom, RoomConfig, RoomError, RoomSnapshot};
pub use security::{BanList, RateLimits, SecurityError, SessionGuard};
pub use server::{GameServer, GameServerError, ServerConfig};
