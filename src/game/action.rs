//! Player Actions
//!
//! The closed set of things a player can do on their turn. Directions use
//! the keyboard letters clients send on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Eight-way movement direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// North (`w`).
    #[serde(rename = "w")]
    Up,
    /// West (`a`).
    #[serde(rename = "a")]
    Left,
    /// South (`s`).
    #[serde(rename = "s")]
    Down,
    /// East (`d`).
    #[serde(rename = "d")]
    Right,
    /// North-west (`q`).
    #[serde(rename = "q")]
    UpLeft,
    /// North-east (`e`).
    #[serde(rename = "e")]
    UpRight,
    /// South-west (`z`).
    #[serde(rename = "z")]
    DownLeft,
    /// South-east (`c`).
    #[serde(rename = "c")]
    DownRight,
}

impl Direction {
    /// Every direction, orthogonals first.
    pub const ALL: [Direction; 8] = [
        Direction::Up,
        Direction::Left,
        Direction::Down,
        Direction::Right,
        Direction::UpLeft,
        Direction::UpRight,
        Direction::DownLeft,
        Direction::DownRight,
    ];

    /// Grid delta `(dx, dy)`; `y` grows downward.
    pub const fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Left => (-1, 0),
            Direction::Down => (0, 1),
            Direction::Right => (1, 0),
            Direction::UpLeft => (-1, -1),
            Direction::UpRight => (1, -1),
            Direction::DownLeft => (-1, 1),
            Direction::DownRight => (1, 1),
        }
    }

    /// Whether both axes change.
    pub const fn is_diagonal(self) -> bool {
        let (dx, dy) = self.delta();
        dx != 0 && dy != 0
    }

    /// Wire letter.
    pub const fn letter(self) -> &'static str {
        match self {
            Direction::Up => "w",
            Direction::Left => "a",
            Direction::Down => "s",
            Direction::Right => "d",
            Direction::UpLeft => "q",
            Direction::UpRight => "e",
            Direction::DownLeft => "z",
            Direction::DownRight => "c",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.letter())
    }
}

/// Returned when a string is not a direction letter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown direction {0:?}")]
pub struct UnknownDirection(pub String);

impl FromStr for Direction {
    type Err = UnknownDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Direction::ALL
            .into_iter()
            .find(|d| d.letter() == s)
            .ok_or_else(|| UnknownDirection(s.to_string()))
    }
}

/// One player action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "dir", rename_all = "snake_case")]
pub enum Action {
    /// Step one cell.
    Move(Direction),
    /// Hand the turn to the next player.
    EndTurn,
}
