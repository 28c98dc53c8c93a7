//! # Oko Zombie Server
//!
//! State sync, persistence and replay for Oko, a turn-based zombie
//! survival game on a square grid.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     OKO ZOMBIE SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Seeded, serializable PRNG                 │
//! │  ├── hash.rs     - SHA-256 digests and HMAC signing          │
//! │  └── clock.rs    - Injectable wall clock                     │
//! │                                                              │
//! │  game/           - Turn simulation (deterministic)           │
//! │  ├── board.rs    - Grid, noise, visibility, paths            │
//! │  ├── action.rs   - Player actions                            │
//! │  ├── state.rs    - Match state and mutators                  │
//! │  ├── ai.rs       - Enemy movement                            │
//! │  ├── events.rs   - Event log                                 │
//! │  └── validate.rs - Invariant checker                         │
//! │                                                              │
//! │  persist/        - Saves                                     │
//! │  ├── save.rs     - Versioned documents, atomic writes        │
//! │  ├── migrate.rs  - Upgrade chain                             │
//! │  └── conflict.rs - Local vs. cloud reconciliation            │
//! │                                                              │
//! │  replay/         - Recording and seekable playback           │
//! │                                                              │
//! │  network/        - Game server and client (non-deterministic)│
//! │  ├── server.rs   - WebSocket server                          │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── lobby.rs    - Lobbies                                   │
//! │  ├── room.rs     - Authoritative match rooms                 │
//! │  ├── invite.rs   - Signed invites                            │
//! │  ├── security.rs - Rate limits and bans                      │
//! │  └── client.rs   - Reconnecting client                       │
//! │                                                              │
//! │  master/         - Server directory (non-deterministic)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism Guarantee
//!
//! The `core/` and `game/` modules are deterministic:
//! - No HashMap in game state (BTreeMap for sorted iteration)
//! - No system time dependencies
//! - All randomness from the seeded [`DeterministicRng`]
//!
//! Given the same seed and the same actions, a match produces the same
//! state hash on every platform, which is what saves and replays rely on.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod master;
pub mod network;
pub mod persist;
pub mod replay;

// Re-export commonly used types
pub use config::Settings;
pub use core::rng::DeterministicRng;
pub use game::action::{Action, Direction};
pub use game::state::{new_game, GameMode, GameState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
