//! Game State
//!
//! The value object every other subsystem revolves around: board, players,
//! enemies, whose turn it is and what happened. Mutation goes through
//! [`GameState::apply`] (or the narrower `move_player` / `end_turn`), and
//! every random draw comes from the caller's [`DeterministicRng`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::hash::{hash_with_domain, StateHash};
use crate::core::rng::DeterministicRng;
use crate::game::action::{Action, Direction};
use crate::game::ai;
use crate::game::board::{Board, Pos};
use crate::game::events::{push_bounded, GameEvent};

/// Noise ticks left behind by a player step.
pub const MOVE_NOISE_TICKS: u32 = 3;

/// Chebyshev radius each player reveals around themselves.
pub const VISION_RADIUS: i32 = 2;

/// Starting player health.
pub const PLAYER_HEALTH: i32 = 10;

/// Starting enemy health.
pub const ENEMY_HEALTH: i32 = 3;

/// A new enemy shambles in every this many full rounds.
pub const SPAWN_INTERVAL: u32 = 5;

// =============================================================================
// ERRORS
// =============================================================================

/// Why a new game could not be set up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreateError {
    /// At least one player is required.
    #[error("a game needs at least one player")]
    NoPlayers,

    /// Not enough room for the requested entities.
    #[error("{width}x{height} board cannot hold {players} players and {enemies} enemies")]
    BoardTooSmall {
        /// Requested width.
        width: u32,
        /// Requested height.
        height: u32,
        /// Requested players.
        players: usize,
        /// Requested enemies.
        enemies: usize,
    },
}

/// Why a move was refused. The state is unchanged when one is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MoveError {
    /// The active index does not point at a player.
    #[error("no active player")]
    NoActivePlayer,

    /// Destination is off the board.
    #[error("destination {0:?} is out of bounds")]
    OutOfBounds(Pos),

    /// Destination is a wall.
    #[error("destination {0:?} is blocked by terrain")]
    Blocked(Pos),

    /// Destination holds a player or enemy.
    #[error("destination {0:?} is occupied")]
    Occupied(Pos),

    /// Diagonal step between two blocked orthogonals.
    #[error("cannot cut the corner to {0:?}")]
    CornerCut(Pos),
}

// =============================================================================
// ENTITIES
// =============================================================================

/// Match flavour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameMode {
    /// Single player.
    #[default]
    Solo,
    /// Local co-op.
    Coop,
    /// Networked match; never persisted locally.
    Online,
}

/// Inventory entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Item {
    /// Restores health.
    Medkit {
        /// Health restored.
        heal: u32,
    },
    /// Ammunition.
    Ammo {
        /// Rounds in the stack.
        rounds: u32,
    },
    /// Melee or ranged weapon.
    Weapon {
        /// Display name.
        name: String,
        /// Damage per hit.
        damage: u32,
    },
    /// Food ration.
    Food,
}

impl Item {
    /// Whether the entry carries sensible values.
    pub fn is_well_formed(&self) -> bool {
        match self {
            Item::Medkit { heal } => *heal > 0,
            Item::Ammo { rounds } => *rounds > 0,
            Item::Weapon { name, damage } => !name.trim().is_empty() && *damage > 0,
            Item::Food => true,
        }
    }
}

/// A survivor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Stable id, equal to the creation index.
    pub id: u32,
    /// Display name.
    pub name: String,
    /// Current cell.
    pub pos: Pos,
    /// Remaining health.
    pub health: i32,
    /// Carried items.
    #[serde(default)]
    pub inventory: Vec<Item>,
}

/// A zombie.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enemy {
    /// Stable id.
    pub id: u32,
    /// Current cell.
    pub pos: Pos,
    /// Remaining health.
    pub health: i32,
}

// =============================================================================
// GAME STATE
// =============================================================================

/// Complete simulation state of one match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    /// Match flavour.
    pub mode: GameMode,
    /// Play field.
    pub board: Board,
    /// Players in turn order.
    pub players: Vec<Player>,
    /// Enemies in activation order.
    #[serde(default)]
    pub enemies: Vec<Enemy>,
    /// Index into `players` of whoever acts next.
    pub active: usize,
    /// Turns ended so far.
    pub turn: u32,
    /// Recent events, oldest first.
    #[serde(default)]
    pub log: Vec<GameEvent>,
}

impl GameState {
    /// Set up a fresh match.
    ///
    /// Player `i` starts at `(i, 0)`; enemies are dropped on random free
    /// cells drawn from `rng`. Mode is `Solo` for one player, `Coop`
    /// otherwise; use [`GameState::with_mode`] to override.
    pub fn create(
        width: u32,
        height: u32,
        player_count: usize,
        enemy_count: usize,
        rng: &mut DeterministicRng,
    ) -> Result<Self, CreateError> {
        if player_count == 0 {
            return Err(CreateError::NoPlayers);
        }
        let too_small = CreateError::BoardTooSmall {
            width,
            height,
            players: player_count,
            enemies: enemy_count,
        };
        if player_count > width as usize || height == 0 {
            return Err(too_small);
        }

        let board = Board::new(width, height);
        let players: Vec<Player> = (0..player_count)
            .map(|i| Player {
                id: i as u32,
                name: format!("Player {}", i + 1),
                pos: Pos::new(i as i32, 0),
                health: PLAYER_HEALTH,
                inventory: Vec::new(),
            })
            .collect();

        let mode = if player_count == 1 { GameMode::Solo } else { GameMode::Coop };
        let mut state = Self {
            mode,
            board,
            players,
            enemies: Vec::new(),
            active: 0,
            turn: 0,
            log: Vec::new(),
        };

        let mut free = state.free_cells();
        if free.len() < enemy_count {
            return Err(too_small);
        }
        for id in 0..enemy_count {
            let idx = rng.next_int(free.len() as u32) as usize;
            let pos = free.swap_remove(idx);
            state.enemies.push(Enemy {
                id: id as u32,
                pos,
                health: ENEMY_HEALTH,
            });
        }

        state.reveal_all();
        Ok(state)
    }

    /// Replace the mode.
    pub fn with_mode(mut self, mode: GameMode) -> Self {
        self.mode = mode;
        self
    }

    /// Player whose turn it is.
    pub fn current(&self) -> Option<&Player> {
        self.players.get(self.active)
    }

    /// Full rounds completed (every player has ended a turn).
    pub fn round(&self) -> u32 {
        match self.players.len() {
            0 => 0,
            n => self.turn / n as u32,
        }
    }

    /// Index of the player standing on `pos`.
    pub fn player_at(&self, pos: Pos) -> Option<usize> {
        self.players.iter().position(|p| p.pos == pos)
    }

    /// Index of the enemy standing on `pos`.
    pub fn enemy_at(&self, pos: Pos) -> Option<usize> {
        self.enemies.iter().position(|e| e.pos == pos)
    }

    /// Whether any entity stands on `pos`.
    pub fn is_occupied(&self, pos: Pos) -> bool {
        self.player_at(pos).is_some() || self.enemy_at(pos).is_some()
    }

    /// Walkable, unoccupied cells in row-major order.
    pub fn free_cells(&self) -> Vec<Pos> {
        let mut cells = Vec::new();
        for y in 0..self.board.height as i32 {
            for x in 0..self.board.width as i32 {
                let p = Pos::new(x, y);
                if self.board.is_walkable(p) && !self.is_occupied(p) {
                    cells.push(p);
                }
            }
        }
        cells
    }

    /// Step the active player one cell.
    ///
    /// Legal when the destination is on the board, not a wall, and empty.
    /// A diagonal step is refused when both orthogonal neighbours it would
    /// squeeze between are blocked.
    pub fn move_player(&mut self, dir: Direction) -> Result<Pos, MoveError> {
        let from = self.current().ok_or(MoveError::NoActivePlayer)?.pos;
        let (dx, dy) = dir.delta();
        let to = from.offset(dx, dy);

        if !self.board.in_bounds(to) {
            return Err(MoveError::OutOfBounds(to));
        }
        if !self.board.is_walkable(to) {
            return Err(MoveError::Blocked(to));
        }
        if self.is_occupied(to) {
            return Err(MoveError::Occupied(to));
        }
        if dir.is_diagonal() {
            let blocked = |p: Pos| !self.board.is_walkable(p) || self.is_occupied(p);
            if blocked(from.offset(dx, 0)) && blocked(from.offset(0, dy)) {
                return Err(MoveError::CornerCut(to));
            }
        }

        let active = self.active;
        let player = &mut self.players[active];
        player.pos = to;
        let id = player.id;

        self.board.add_noise(to, MOVE_NOISE_TICKS);
        self.board.reveal_around(to, VISION_RADIUS);
        push_bounded(&mut self.log, GameEvent::Move { player: id, from, to });
        Ok(to)
    }

    /// Finish the active player's turn.
    ///
    /// Noise decays by one tick, the turn counter advances and the next
    /// player in order becomes active.
    pub fn end_turn(&mut self) {
        self.board.decay_noise();
        if !self.players.is_empty() {
            self.active = (self.active + 1) % self.players.len();
        }
        self.turn += 1;
        push_bounded(
            &mut self.log,
            GameEvent::EndTurn {
                turn: self.turn,
                active: self.active,
            },
        );
    }

    /// Apply one action as the authoritative mutator.
    ///
    /// Ending the last player's turn closes the round: enemies act, and
    /// every [`SPAWN_INTERVAL`] rounds one more enemy spawns on a free cell
    /// drawn from `rng`.
    pub fn apply(&mut self, action: Action, rng: &mut DeterministicRng) -> Result<(), MoveError> {
        match action {
            Action::Move(dir) => self.move_player(dir).map(|_| ()),
            Action::EndTurn => {
                self.end_turn();
                if self.active == 0 {
                    ai::zombie_turns(self);
                    if self.round() % SPAWN_INTERVAL == 0 {
                        self.spawn_enemy(rng);
                    }
                }
                Ok(())
            }
        }
    }

    /// Drop one enemy on a random free cell. Returns its position.
    pub fn spawn_enemy(&mut self, rng: &mut DeterministicRng) -> Option<Pos> {
        let free = self.free_cells();
        let pos = *rng.choose(&free)?;
        let id = self.enemies.iter().map(|e| e.id + 1).max().unwrap_or(0);
        self.enemies.push(Enemy {
            id,
            pos,
            health: ENEMY_HEALTH,
        });
        push_bounded(&mut self.log, GameEvent::EnemySpawn { enemy: id, at: pos });
        Some(pos)
    }

    /// Seat a late joiner on the first free cell in row-major order.
    /// Returns the new player's index.
    pub fn add_player(&mut self, name: &str) -> Option<usize> {
        let pos = *self.free_cells().first()?;
        let id = self.players.iter().map(|p| p.id + 1).max().unwrap_or(0);
        self.players.push(Player {
            id,
            name: name.to_string(),
            pos,
            health: PLAYER_HEALTH,
            inventory: Vec::new(),
        });
        self.board.reveal_around(pos, VISION_RADIUS);
        Some(self.players.len() - 1)
    }

    /// Positions of all players.
    pub fn player_positions(&self) -> BTreeSet<Pos> {
        self.players.iter().map(|p| p.pos).collect()
    }

    fn reveal_all(&mut self) {
        let positions: Vec<Pos> = self.players.iter().map(|p| p.pos).collect();
        for pos in positions {
            self.board.reveal_around(pos, VISION_RADIUS);
        }
    }

    /// SHA-256 over the bincode encoding of the whole state.
    pub fn compute_hash(&self) -> Result<StateHash, bincode::Error> {
        let bytes = bincode::serialize(self)?;
        Ok(hash_with_domain(b"OKO_STATE_V1", &bytes))
    }
}

/// Convenience entry point: build a match and the generator that drives it.
pub fn new_game(
    width: u32,
    height: u32,
    player_count: usize,
    enemy_count: usize,
    seed: u64,
) -> Result<(GameState, DeterministicRng), CreateError> {
    let mut rng = DeterministicRng::new(seed);
    let state = GameState::create(width, height, player_count, enemy_count, &mut rng)?;
    Ok((state, rng))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::board::Tile;
    use proptest::prelude::*;

    fn empty_state(width: u32, height: u32, players: usize) -> GameState {
        let (state, _) = new_game(width, height, players, 0, 1).unwrap();
        state
    }

    #[test]
    fn test_create_layout() {
        let (state, _) = new_game(8, 8, 3, 4, 42).unwrap();
        assert_eq!(state.mode, GameMode::Coop);
        assert_eq!(state.players.len(), 3);
        assert_eq!(state.enemies.len(), 4);
        for (i, p) in state.players.iter().enumerate() {
            assert_eq!(p.pos, Pos::new(i as i32, 0));
        }
        let mut cells: BTreeSet<Pos> = state.player_positions();
        for e in &state.enemies {
            assert!(cells.insert(e.pos), "shared cell {:?}", e.pos);
        }
        assert!(state.board.visible.contains(&Pos::new(2, 2)));
    }

    #[test]
    fn test_create_errors() {
        assert_eq!(new_game(5, 5, 0, 0, 1).unwrap_err(), CreateError::NoPlayers);
        assert!(matches!(
            new_game(2, 2, 3, 0, 1).unwrap_err(),
            CreateError::BoardTooSmall { .. }
        ));
        assert!(matches!(
            new_game(2, 1, 1, 5, 1).unwrap_err(),
            CreateError::BoardTooSmall { .. }
        ));
    }

    #[test]
    fn test_move_and_noise() {
        let mut state = empty_state(5, 5, 1);
        assert_eq!(state.move_player(Direction::Right), Ok(Pos::new(1, 0)));
        assert_eq!(state.board.noise.get(&Pos::new(1, 0)), Some(&MOVE_NOISE_TICKS));
        assert_eq!(
            state.move_player(Direction::Up),
            Err(MoveError::OutOfBounds(Pos::new(1, -1)))
        );
    }

    #[test]
    fn test_move_blocked_and_occupied() {
        let mut state = empty_state(5, 5, 2);
        assert_eq!(
            state.move_player(Direction::Right),
            Err(MoveError::Occupied(Pos::new(1, 0)))
        );
        state.board.set_tile(Pos::new(0, 1), Tile::Wall);
        assert_eq!(
            state.move_player(Direction::Down),
            Err(MoveError::Blocked(Pos::new(0, 1)))
        );
        assert_eq!(state.players[0].pos, Pos::new(0, 0));
    }

    #[test]
    fn test_corner_cutting() {
        let mut state = empty_state(5, 5, 1);
        state.players[0].pos = Pos::new(1, 1);
        state.board.set_tile(Pos::new(2, 1), Tile::Wall);
        state.board.set_tile(Pos::new(1, 2), Tile::Wall);
        assert_eq!(
            state.move_player(Direction::DownRight),
            Err(MoveError::CornerCut(Pos::new(2, 2)))
        );

        // One open flank is enough.
        state.board.set_tile(Pos::new(1, 2), Tile::Floor);
        assert_eq!(state.move_player(Direction::DownRight), Ok(Pos::new(2, 2)));
    }

    #[test]
    fn test_end_turn_rotates_and_decays() {
        let mut state = empty_state(5, 5, 2);
        state.players[0].pos = Pos::new(0, 2);
        state.move_player(Direction::Down).unwrap();
        state.end_turn();
        assert_eq!(state.active, 1);
        assert_eq!(state.turn, 1);
        assert_eq!(state.board.noise.get(&Pos::new(0, 3)), Some(&(MOVE_NOISE_TICKS - 1)));
        state.end_turn();
        assert_eq!(state.active, 0);
        assert_eq!(state.round(), 1);
    }

    #[test]
    fn test_spawn_after_interval() {
        let (mut state, mut rng) = new_game(6, 6, 1, 0, 9).unwrap();
        for _ in 0..SPAWN_INTERVAL {
            state.apply(Action::EndTurn, &mut rng).unwrap();
        }
        assert_eq!(state.enemies.len(), 1);
    }

    #[test]
    fn test_hash_tracks_changes() {
        let mut state = empty_state(4, 4, 1);
        let before = state.compute_hash().unwrap();
        assert_eq!(before, state.clone().compute_hash().unwrap());
        let encoded = bincode::serialize(&state).unwrap();
        assert!(!encoded.is_empty());
        assert_eq!(before, hash_with_domain(b"OKO_STATE_V1", &encoded));
        assert_ne!(before, hash_with_domain(b"OKO_STATE_V1", &[]));
        state.move_player(Direction::Down).unwrap();
        assert_ne!(before, state.compute_hash().unwrap());
    }

    #[test]
    fn test_add_player_takes_first_free_cell() {
        let mut state = empty_state(4, 4, 2);
        let idx = state.add_player("late").unwrap();
        assert_eq!(idx, 2);
        assert_eq!(state.players[2].pos, Pos::new(2, 0));
        assert_eq!(state.players[2].id, 2);
    }

    fn run(seed: u64, inputs: &[u8]) -> GameState {
        let (mut state, mut rng) = new_game(7, 7, 2, 3, seed).unwrap();
        for &i in inputs {
            let action = match i % 9 {
                8 => Action::EndTurn,
                d => Action::Move(Direction::ALL[d as usize]),
            };
            let _ = state.apply(action, &mut rng);
        }
        state
    }

    proptest! {
        #[test]
        fn prop_simulation_is_deterministic(seed in any::<u64>(), inputs in proptest::collection::vec(any::<u8>(), 0..64)) {
            let a = run(seed, &inputs);
            let b = run(seed, &inputs);
            prop_assert_eq!(&a.players, &b.players);
            prop_assert_eq!(&a.enemies, &b.enemies);
            prop_assert_eq!(a.turn, b.turn);
            prop_assert_eq!(&a.board.noise, &b.board.noise);
            prop_assert_eq!(a.compute_hash().unwrap(), b.compute_hash().unwrap());
        }
    }
}
