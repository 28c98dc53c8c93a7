//! Replay Line Types

use serde::{Deserialize, Serialize};

use crate::core::rng::RngState;
use crate::game::action::{Action, Direction};
use crate::game::state::{GameMode, GameState};
use crate::network::protocol::PROTOCOL_VERSION;

/// Current replay layout.
pub const FORMAT_VERSION: u32 = 2;

/// First line of every replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayHeader {
    /// Layout version.
    pub format_version: u32,
    /// Build that recorded the file.
    pub game_build: String,
    /// Wire protocol version at recording time.
    pub protocol_version: u32,
    /// Reserved for an inline signature; the trailer line carries the
    /// actual HMAC.
    #[serde(default)]
    pub signature: Option<String>,
}

impl Default for ReplayHeader {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            game_build: crate::VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            signature: None,
        }
    }
}

/// Second line of every replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMeta {
    /// Match seed.
    pub seed: u64,
    /// Match flavour.
    pub mode: GameMode,
    /// Scenario or map identifier.
    pub map_id: String,
}

/// Event line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayEvent {
    /// A player stepped.
    Move {
        /// Turn the step happened in.
        turn: u32,
        /// Player index.
        player: usize,
        /// Direction.
        dir: Direction,
    },
    /// A player ended their turn.
    EndTurn {
        /// Turn that ended.
        turn: u32,
        /// Player index.
        player: usize,
    },
    /// Full state snapshot.
    Checkpoint {
        /// Turn counter of the snapshot.
        turn: u32,
        /// Complete state.
        state: Box<GameState>,
        /// Generator at the snapshot.
        rng: RngState,
    },
}

impl ReplayEvent {
    /// Event for an applied action.
    pub fn from_action(turn: u32, player: usize, action: Action) -> Self {
        match action {
            Action::Move(dir) => ReplayEvent::Move { turn, player, dir },
            Action::EndTurn => ReplayEvent::EndTurn { turn, player },
        }
    }

    /// Turn the event belongs to.
    pub fn turn(&self) -> u32 {
        match self {
            ReplayEvent::Move { turn, .. }
            | ReplayEvent::EndTurn { turn, .. }
            | ReplayEvent::Checkpoint { turn, .. } => *turn,
        }
    }

    /// The player action, for non-checkpoint events.
    pub fn action(&self) -> Option<Action> {
        match self {
            ReplayEvent::Move { dir, .. } => Some(Action::Move(*dir)),
            ReplayEvent::EndTurn { .. } => Some(Action::EndTurn),
            ReplayEvent::Checkpoint { .. } => None,
        }
    }
}

/// Optional final line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignatureLine {
    /// Hex HMAC-SHA256 over all preceding lines, each followed by `\n`.
    pub signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = ReplayEvent::Move { turn: 3, player: 1, dir: Direction::Right };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json, serde_json::json!({"type": "MOVE", "turn": 3, "player": 1, "dir": "d"}));
        assert_eq!(event.action(), Some(Action::Move(Direction::Right)));
    }

    #[test]
    fn test_signature_line_is_strict() {
        assert!(serde_json::from_str::<SignatureLine>(r#"{"signature": "ab"}"#).is_ok());
        assert!(serde_json::from_str::<SignatureLine>(r#"{"signature": "ab", "type": "MOVE"}"#).is_err());
    }
}
