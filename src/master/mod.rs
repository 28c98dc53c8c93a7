//! Master Directory
//!
//! The registry of live game servers, its WebSocket front end, and the
//! announcer that game servers run to stay listed. Like the game network
//! layer this is non-deterministic and never touches simulation state.

pub mod announcer;
pub mod auth;
pub mod protocol;
pub mod registry;
pub mod server;

pub use announcer::{AnnounceError, Announcer, AnnouncerConfig};
pub use auth::{verify_registration, AuthConfig, AuthError, TokenClaims};
pub use protocol::{MasterReply, MasterRequest, MASTER_PROTOCOL_VERSION};
pub use registry::{ListFilter, LobbyInfo, MasterRegistry, RegistryError, ServerEntry};
pub use server::{MasterConfig, MasterServer, MasterServerError};
