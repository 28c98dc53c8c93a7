//! Game Events
//!
//! Entries in a `GameState` log. The log is part of the serialized state so
//! clients can show what happened since their last snapshot.

use serde::{Deserialize, Serialize};

use super::board::Pos;

/// Most recent entries kept in a state's log.
pub const LOG_CAPACITY: usize = 128;

/// Something that happened during simulation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameEvent {
    /// A player stepped to a new cell.
    Move {
        /// Player id.
        player: u32,
        /// Origin.
        from: Pos,
        /// Destination.
        to: Pos,
    },
    /// The active player ended their turn.
    EndTurn {
        /// Turn counter after advancing.
        turn: u32,
        /// Index of the new active player.
        active: usize,
    },
    /// An enemy moved.
    EnemyMove {
        /// Enemy id.
        enemy: u32,
        /// Destination.
        to: Pos,
    },
    /// An enemy hit a player.
    EnemyAttack {
        /// Enemy id.
        enemy: u32,
        /// Player id.
        player: u32,
        /// Player health after the hit.
        health: i32,
    },
    /// A new enemy appeared.
    EnemySpawn {
        /// Enemy id.
        enemy: u32,
        /// Spawn cell.
        at: Pos,
    },
}

/// Append to a bounded log, discarding the oldest entries.
pub fn push_bounded(log: &mut Vec<GameEvent>, event: GameEvent) {
    log.push(event);
    if log.len() > LOG_CAPACITY {
        let excess = log.len() - LOG_CAPACITY;
        log.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tagging() {
        let event = GameEvent::EndTurn { turn: 3, active: 1 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "END_TURN");
    }

    #[test]
    fn test_log_is_bounded() {
        let mut log = Vec::new();
        for turn in 0..(LOG_CAPACITY as u32 + 10) {
            push_bounded(&mut log, GameEvent::EndTurn { turn, active: 0 });
        }
        assert_eq!(log.len(), LOG_CAPACITY);
        assert_eq!(log[0], GameEvent::EndTurn { turn: 10, active: 0 });
    }
}
