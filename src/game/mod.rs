//! Game Logic Module
//!
//! Deterministic turn simulation. Nothing here reads the clock or any
//! entropy source; randomness arrives through an explicit
//! [`DeterministicRng`](crate::core::rng::DeterministicRng).
//!
//! ## Module Structure
//!
//! - `board`: grid, noise map, visibility, path search
//! - `action`: directions and player actions
//! - `state`: match state and its mutators
//! - `ai`: enemy movement
//! - `events`: log entries
//! - `validate`: invariant checker

pub mod action;
pub mod ai;
pub mod board;
pub mod events;
pub mod state;
pub mod validate;

// Re-export key types
pub use action::{Action, Direction};
pub use board::{Board, Pos, Tile};
pub use events::GameEvent;
pub use state::{new_game, CreateError, Enemy, GameMode, GameState, Item, MoveError, Player};
pub use validate::{validate_state, StateViolation};
