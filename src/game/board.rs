//! Board
//!
//! Tile grid plus the two overlays the simulation keeps per cell: the noise
//! map (position -> ticks remaining) that attracts enemies, and the set of
//! positions players have revealed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

/// BFS expansion order: east, west, south, north (y grows downward).
pub const CARDINALS: [(i32, i32); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];

/// Grid coordinate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pos {
    /// Column.
    pub x: i32,
    /// Row.
    pub y: i32,
}

impl Pos {
    /// Create a position.
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Position shifted by a delta.
    pub const fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }

    /// Chebyshev distance.
    pub fn chebyshev(self, other: Pos) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

/// Terrain of a single cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tile {
    /// Walkable ground.
    #[default]
    Floor,
    /// Solid wall.
    Wall,
}

impl Tile {
    fn symbol(self) -> char {
        match self {
            Tile::Floor => '.',
            Tile::Wall => '#',
        }
    }

    fn from_symbol(c: char) -> Option<Self> {
        match c {
            '.' => Some(Tile::Floor),
            '#' => Some(Tile::Wall),
            _ => None,
        }
    }
}

/// Rectangular play field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
    /// Row-major tiles, serialized as a flat `.`/`#` string.
    #[serde(with = "tile_rows")]
    pub tiles: Vec<Tile>,
    /// Noise markers and their remaining ticks.
    #[serde(with = "noise_entries", default)]
    pub noise: BTreeMap<Pos, u32>,
    /// Revealed cells.
    #[serde(default)]
    pub visible: BTreeSet<Pos>,
}

impl Board {
    /// All-floor board.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            tiles: vec![Tile::Floor; (width as usize) * (height as usize)],
            noise: BTreeMap::new(),
            visible: BTreeSet::new(),
        }
    }

    /// Whether `pos` lies on the grid.
    pub fn in_bounds(&self, pos: Pos) -> bool {
        pos.x >= 0 && pos.y >= 0 && (pos.x as u32) < self.width && (pos.y as u32) < self.height
    }

    fn index(&self, pos: Pos) -> Option<usize> {
        if self.in_bounds(pos) {
            Some(pos.y as usize * self.width as usize + pos.x as usize)
        } else {
            None
        }
    }

    /// Tile at `pos`, `None` when out of bounds.
    pub fn tile(&self, pos: Pos) -> Option<Tile> {
        self.index(pos).and_then(|i| self.tiles.get(i).copied())
    }

    /// Overwrite a tile. Out-of-bounds writes are ignored.
    pub fn set_tile(&mut self, pos: Pos, tile: Tile) {
        if let Some(slot) = self.index(pos).and_then(|i| self.tiles.get_mut(i)) {
            *slot = tile;
        }
    }

    /// In bounds and not a wall.
    pub fn is_walkable(&self, pos: Pos) -> bool {
        self.tile(pos) == Some(Tile::Floor)
    }

    /// Leave a noise marker, keeping the louder of an existing one.
    pub fn add_noise(&mut self, pos: Pos, ticks: u32) {
        if ticks == 0 || !self.in_bounds(pos) {
            return;
        }
        let entry = self.noise.entry(pos).or_insert(0);
        *entry = (*entry).max(ticks);
    }

    /// Age every marker by one tick, dropping the ones that reach zero.
    pub fn decay_noise(&mut self) {
        self.noise.retain(|_, ticks| {
            *ticks = ticks.saturating_sub(1);
            *ticks > 0
        });
    }

    /// Reveal every in-bounds cell within `radius` of `center`.
    pub fn reveal_around(&mut self, center: Pos, radius: i32) {
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let p = center.offset(dx, dy);
                if self.in_bounds(p) {
                    self.visible.insert(p);
                }
            }
        }
    }

    /// Breadth-first search from `start` to the nearest cell in `goals`.
    ///
    /// Expands cardinal neighbours in [`CARDINALS`] order, so ties between
    /// equally distant goals always resolve the same way. A cell is entered
    /// when it is walkable and `passable` accepts it, or when it is a goal.
    /// Returns the steps after `start` (ending at the goal), or `None` when
    /// no goal is reachable. `start` itself never counts as reached.
    pub fn find_path<F>(&self, start: Pos, goals: &BTreeSet<Pos>, passable: F) -> Option<Vec<Pos>>
    where
        F: Fn(Pos) -> bool,
    {
        if goals.is_empty() {
            return None;
        }

        let mut came_from: BTreeMap<Pos, Pos> = BTreeMap::new();
        let mut visited: BTreeSet<Pos> = BTreeSet::from([start]);
        let mut queue: VecDeque<Pos> = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            for (dx, dy) in CARDINALS {
                let next = current.offset(dx, dy);
                if !self.in_bounds(next) || visited.contains(&next) {
                    continue;
                }
                let is_goal = goals.contains(&next);
                if !is_goal && !(self.is_walkable(next) && passable(next)) {
                    continue;
                }
                visited.insert(next);
                came_from.insert(next, current);
                if is_goal {
                    return Some(rebuild_path(&came_from, start, next));
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Render rows as `.`/`#` strings.
    pub fn rows(&self) -> Vec<String> {
        self.tiles
            .chunks(self.width.max(1) as usize)
            .map(|row| row.iter().map(|t| t.symbol()).collect())
            .collect()
    }
}

fn rebuild_path(came_from: &BTreeMap<Pos, Pos>, start: Pos, goal: Pos) -> Vec<Pos> {
    let mut path = vec![goal];
    let mut cur = goal;
    while let Some(&prev) = came_from.get(&cur) {
        if prev == start {
            break;
        }
        path.push(prev);
        cur = prev;
    }
    path.reverse();
    path
}

mod tile_rows {
    use super::Tile;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(tiles: &[Tile], s: S) -> Result<S::Ok, S::Error> {
        // length is checked against width * height by `validate_state`
        let flat: String = tiles.iter().map(|t| t.symbol()).collect();
        s.serialize_str(&flat)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Tile>, D::Error> {
        let flat = String::deserialize(d)?;
        flat.chars()
            .map(|c| Tile::from_symbol(c).ok_or_else(|| D::Error::custom(format!("unknown tile {c:?}"))))
            .collect()
    }
}

mod noise_entries {
    use super::Pos;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        x: i32,
        y: i32,
        ticks: u32,
    }

    pub fn serialize<S: Serializer>(noise: &BTreeMap<Pos, u32>, s: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<Entry> = noise
            .iter()
            .map(|(p, &ticks)| Entry { x: p.x, y: p.y, ticks })
            .collect();
        entries.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<Pos, u32>, D::Error> {
        let entries = Vec::<Entry>::deserialize(d)?;
        Ok(entries
            .into_iter()
            .map(|e| (Pos::new(e.x, e.y), e.ticks))
            .collect())
    }
}

// =============================================================================
// TESTS
// =============================================================================
