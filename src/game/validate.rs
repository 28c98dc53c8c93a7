//! State Validation
//!
//! Structural invariants every `GameState` must satisfy, checked after
//! loading a save and when restoring replay checkpoints.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::game::board::{Pos, Tile};
use crate::game::state::GameState;

/// First invariant a state was found to break.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateViolation {
    /// Tile count does not match width * height.
    #[error("board has {actual} tiles, expected {expected}")]
    BoardSize {
        /// width * height.
        expected: usize,
        /// Tiles present.
        actual: usize,
    },

    /// Player list is empty.
    #[error("state has no players")]
    NoPlayers,

    /// `active` does not index a player.
    #[error("active index {active} out of range for {players} players")]
    ActiveOutOfRange {
        /// Active index.
        active: usize,
        /// Player count.
        players: usize,
    },

    /// An entity stands off the board or inside a wall.
    #[error("entity at {0:?} is not on a walkable cell")]
    EntityOffFloor(Pos),

    /// Two entities share a cell.
    #[error("two entities share cell {0:?}")]
    SharedCell(Pos),

    /// A noise marker references a position off the board.
    #[error("noise marker at {0:?} is out of bounds")]
    NoiseOutOfBounds(Pos),

    /// A noise marker has no ticks left but was not removed.
    #[error("noise marker at {0:?} has expired")]
    NoiseExpired(Pos),

    /// An inventory entry carries nonsense values.
    #[error("player {player} has malformed inventory entry {index}")]
    BadItem {
        /// Player id.
        player: u32,
        /// Position in the inventory.
        index: usize,
    },
}

/// Check every structural invariant of `state`.
pub fn validate_state(state: &GameState) -> Result<(), StateViolation> {
    let board = &state.board;
    let expected = board.width as usize * board.height as usize;
    if board.tiles.len() != expected {
        return Err(StateViolation::BoardSize {
            expected,
            actual: board.tiles.len(),
        });
    }

    if state.players.is_empty() {
        return Err(StateViolation::NoPlayers);
    }
    if state.active >= state.players.len() {
        return Err(StateViolation::ActiveOutOfRange {
            active: state.active,
            players: state.players.len(),
        });
    }

    let mut occupied = BTreeSet::new();
    let positions = state
        .players
        .iter()
        .map(|p| p.pos)
        .chain(state.enemies.iter().map(|e| e.pos));
    for pos in positions {
        if board.tile(pos) != Some(Tile::Floor) {
            return Err(StateViolation::EntityOffFloor(pos));
        }
        if !occupied.insert(pos) {
            return Err(StateViolation::SharedCell(pos));
        }
    }

    for (&pos, &ticks) in &board.noise {
        if !board.in_bounds(pos) {
            return Err(StateViolation::NoiseOutOfBounds(pos));
        }
        if ticks == 0 {
            return Err(StateViolation::NoiseExpired(pos));
        }
    }

    for player in &state.players {
        if let Some(index) = player.inventory.iter().position(|item| !item.is_well_formed()) {
            return Err(StateViolation::BadItem {
                player: player.id,
                index,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{new_game, Item};

    fn valid() -> GameState {
        new_game(5, 5, 2, 2, 7).unwrap().0
    }

    #[test]
    fn test_fresh_state_is_valid() {
        assert_eq!(validate_state(&valid()), Ok(()));
    }

    #[test]
    fn test_detects_shared_cell() {
        let mut state = valid();
        state.enemies[0].pos = state.players[1].pos;
        assert!(matches!(validate_state(&state), Err(StateViolation::SharedCell(_))));
    }

    #[test]
    fn test_detects_bad_active_and_board() {
        let mut state = valid();
        state.active = 2;
        assert!(matches!(
            validate_state(&state),
            Err(StateViolation::ActiveOutOfRange { active: 2, players: 2 })
        ));

        let mut state = valid();
        state.board.tiles.pop();
        assert!(matches!(validate_state(&state), Err(StateViolation::BoardSize { .. })));
    }

    #[test]
    fn test_detects_noise_and_items() {
        let mut state = valid();
        state.board.noise.insert(Pos::new(9, 9), 1);
        assert_eq!(
            validate_state(&state),
            Err(StateViolation::NoiseOutOfBounds(Pos::new(9, 9)))
        );

        let mut state = valid();
        state.players[0].inventory.push(Item::Ammo { rounds: 0 });
        assert_eq!(
            validate_state(&state),
            Err(StateViolation::BadItem { player: 0, index: 0 })
        );
    }
}
