//! Enemy AI
//!
//! Each enemy, in list order, searches toward the nearest noise marker and
//! falls back to the nearest player when no noise is reachable. The search
//! is the board's breadth-first search, so ties break by its fixed
//! expansion order. Enemies never step onto an occupied cell: when the next
//! step is a player, the enemy attacks that player instead of moving.

use std::collections::BTreeSet;

use crate::game::board::Pos;
use crate::game::events::{push_bounded, GameEvent};
use crate::game::state::GameState;

/// Run one activation for every enemy.
pub fn zombie_turns(state: &mut GameState) {
    for idx in 0..state.enemies.len() {
        let Some(step) = next_step(state, idx) else {
            continue;
        };
        let enemy_id = state.enemies[idx].id;

        if let Some(target) = state.player_at(step) {
            let player = &mut state.players[target];
            player.health = (player.health - 1).max(0);
            let event = GameEvent::EnemyAttack {
                enemy: enemy_id,
                player: player.id,
                health: player.health,
            };
            push_bounded(&mut state.log, event);
        } else if state.enemy_at(step).is_none() {
            state.enemies[idx].pos = step;
            push_bounded(&mut state.log, GameEvent::EnemyMove { enemy: enemy_id, to: step });
        }
    }
}

/// First cell on the chosen path for enemy `idx`, if any target is reachable.
fn next_step(state: &GameState, idx: usize) -> Option<Pos> {
    let start = state.enemies[idx].pos;
    let passable = |p: Pos| !state.is_occupied(p);

    let noise: BTreeSet<Pos> = state.board.noise.keys().copied().collect();
    let path = state
        .board
        .find_path(start, &noise, passable)
        .or_else(|| state.board.find_path(start, &state.player_positions(), passable))?;
    path.first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::board::Tile;
    use crate::game::state::{new_game, Enemy, ENEMY_HEALTH};

    fn with_enemy(at: Pos) -> GameState {
        let (mut state, _) = new_game(6, 6, 1, 0, 3).unwrap();
        state.enemies.push(Enemy { id: 0, pos: at, health: ENEMY_HEALTH });
        state
    }

    #[test]
    fn test_enemy_chases_player() {
        let mut state = with_enemy(Pos::new(0, 4));
        zombie_turns(&mut state);
        assert_eq!(state.enemies[0].pos, Pos::new(0, 3));
    }

    #[test]
    fn test_noise_beats_player() {
        let mut state = with_enemy(Pos::new(3, 3));
        state.board.add_noise(Pos::new(5, 3), 2);
        zombie_turns(&mut state);
        assert_eq!(state.enemies[0].pos, Pos::new(4, 3));
    }

    #[test]
    fn test_adjacent_enemy_attacks_instead_of_moving() {
        let mut state = with_enemy(Pos::new(0, 1));
        zombie_turns(&mut state);
        assert_eq!(state.enemies[0].pos, Pos::new(0, 1));
        assert_eq!(state.players[0].health, crate::game::state::PLAYER_HEALTH - 1);
        assert!(matches!(state.log.last(), Some(GameEvent::EnemyAttack { .. })));
    }

    #[test]
    fn test_walled_in_enemy_stays() {
        let mut state = with_enemy(Pos::new(5, 5));
        state.board.set_tile(Pos::new(4, 5), Tile::Wall);
        state.board.set_tile(Pos::new(5, 4), Tile::Wall);
        zombie_turns(&mut state);
        assert_eq!(state.enemies[0].pos, Pos::new(5, 5));
    }

    #[test]
    fn test_enemies_never_stack() {
        let (mut state, _) = new_game(6, 6, 1, 0, 3).unwrap();
        state.enemies.push(Enemy { id: 0, pos: Pos::new(0, 3), health: 1 });
        state.enemies.push(Enemy { id: 1, pos: Pos::new(0, 4), health: 1 });
        for _ in 0..5 {
            zombie_turns(&mut state);
            assert_ne!(state.enemies[0].pos, state.enemies[1].pos);
        }
    }
}
