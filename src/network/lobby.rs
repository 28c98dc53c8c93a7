//! Lobbies
//!
//! A lobby is the pre-match gathering place: a capacity-bounded, ordered
//! list of player names with per-player ready flags and RTT estimates.
//! [`LobbyManager`] owns every lobby on a server and retires empty ones
//! after a linger period rather than immediately, so a player whose
//! connection blips does not lose the lobby.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::network::client::RttTracker;

/// Default lobby capacity.
pub const DEFAULT_MAX_PLAYERS: usize = 4;

/// Largest capacity a lobby may ask for. Match boards are this wide, and
/// every player starts on the top row.
pub const MAX_LOBBY_PLAYERS: usize = 12;

/// Lobby operation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LobbyError {
    /// No lobby with that id.
    #[error("lobby {0} not found")]
    NotFound(String),

    /// At capacity.
    #[error("lobby {lobby} is full ({max} players)")]
    Full {
        /// Lobby id.
        lobby: String,
        /// Capacity.
        max: usize,
    },

    /// Name already present.
    #[error("{0} is already in the lobby")]
    AlreadyJoined(String),

    /// Name not present.
    #[error("{0} is not in the lobby")]
    NotMember(String),

    /// Requested capacity is zero.
    #[error("lobby capacity must be at least one")]
    ZeroCapacity,

    /// Requested capacity exceeds what a match can seat.
    #[error("lobby capacity {requested} exceeds the maximum of {max}")]
    CapacityTooLarge {
        /// Requested capacity.
        requested: usize,
        /// Largest allowed.
        max: usize,
    },
}

fn default_max_players() -> usize {
    DEFAULT_MAX_PLAYERS
}

fn default_mode() -> String {
    "coop".to_string()
}

fn yes() -> bool {
    true
}

/// Creation options. Also the payload of a `LOBBY_CREATE` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbySettings {
    /// Display name.
    pub name: String,
    /// Capacity.
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    /// Mode label shown in listings.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Region label.
    #[serde(default)]
    pub region: String,
    /// Hidden from listings; reachable by id or invite only.
    #[serde(default)]
    pub private: bool,
    /// Players may join after the match has started.
    #[serde(default)]
    pub allow_drop_in: bool,
    /// Spectators may attach.
    #[serde(default = "yes")]
    pub allow_spectators: bool,
}

impl LobbySettings {
    /// Public co-op lobby with default capacity.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_players: DEFAULT_MAX_PLAYERS,
            mode: default_mode(),
            region: String::new(),
            private: false,
            allow_drop_in: false,
            allow_spectators: true,
        }
    }
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbySummary {
    /// Lobby id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Mode label.
    pub mode: String,
    /// Capacity.
    pub max_players: usize,
    /// Players present.
    pub cur_players: usize,
    /// Region label.
    pub region: String,
    /// Hidden from listings.
    pub private: bool,
}

/// Full lobby view sent to members on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyStatus {
    /// Listing fields.
    #[serde(flatten)]
    pub summary: LobbySummary,
    /// Players in join order.
    pub players: Vec<String>,
    /// Ready flags by name.
    pub ready: BTreeMap<String, bool>,
    /// Smoothed RTT by name, in seconds.
    pub rtt: BTreeMap<String, f64>,
}

/// One lobby.
#[derive(Debug, Clone)]
pub struct Lobby {
    id: String,
    settings: LobbySettings,
    seed: u64,
    players: Vec<String>,
    ready: BTreeMap<String, bool>,
    rtt: BTreeMap<String, RttTracker>,
    empty_since: Option<f64>,
}

impl Lobby {
    /// Empty lobby.
    pub fn new(id: impl Into<String>, settings: LobbySettings, seed: u64) -> Self {
        Self {
            id: id.into(),
            settings,
            seed,
            players: Vec::new(),
            ready: BTreeMap::new(),
            rtt: BTreeMap::new(),
            empty_since: None,
        }
    }

    /// Lobby id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation options.
    pub fn settings(&self) -> &LobbySettings {
        &self.settings
    }

    /// Seed for the match this lobby will start.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Players in join order.
    pub fn players(&self) -> &[String] {
        &self.players
    }

    /// Number of players present.
    pub fn cur_players(&self) -> usize {
        self.players.len()
    }

    /// No one present.
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Whether `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.players.iter().any(|p| p == name)
    }

    /// Add a player, returning their position in the join order.
    pub fn join(&mut self, name: &str) -> Result<usize, LobbyError> {
        if self.contains(name) {
            return Err(LobbyError::AlreadyJoined(name.to_string()));
        }
        if self.players.len() >= self.settings.max_players {
            return Err(LobbyError::Full {
                lobby: self.id.clone(),
                max: self.settings.max_players,
            });
        }
        self.players.push(name.to_string());
        self.ready.insert(name.to_string(), false);
        self.empty_since = None;
        debug!(lobby = %self.id, player = name, count = self.players.len(), "player joined lobby");
        Ok(self.players.len() - 1)
    }

    /// Remove a player and their ready flag and RTT.
    pub fn leave(&mut self, name: &str) -> Result<(), LobbyError> {
        let idx = self
            .players
            .iter()
            .position(|p| p == name)
            .ok_or_else(|| LobbyError::NotMember(name.to_string()))?;
        self.players.remove(idx);
        self.ready.remove(name);
        self.rtt.remove(name);
        debug!(lobby = %self.id, player = name, count = self.players.len(), "player left lobby");
        Ok(())
    }

    /// Set a member's ready flag.
    pub fn set_ready(&mut self, name: &str, ready: bool) -> Result<(), LobbyError> {
        let flag = self
            .ready
            .get_mut(name)
            .ok_or_else(|| LobbyError::NotMember(name.to_string()))?;
        *flag = ready;
        Ok(())
    }

    /// At least one player, and every player ready.
    pub fn all_ready(&self) -> bool {
        !self.players.is_empty() && self.players.iter().all(|p| self.ready.get(p).copied().unwrap_or(false))
    }

    /// Fold an RTT sample into a member's estimate.
    pub fn record_rtt(&mut self, name: &str, sample: f64) -> Option<f64> {
        if !self.contains(name) {
            return None;
        }
        Some(self.rtt.entry(name.to_string()).or_default().sample(sample))
    }

    /// A member's smoothed RTT.
    pub fn rtt(&self, name: &str) -> Option<f64> {
        self.rtt.get(name).and_then(RttTracker::smoothed)
    }

    /// Listing entry.
    pub fn summary(&self) -> LobbySummary {
        LobbySummary {
            id: self.id.clone(),
            name: self.settings.name.clone(),
            mode: self.settings.mode.clone(),
            max_players: self.settings.max_players,
            cur_players: self.players.len(),
            region: self.settings.region.clone(),
            private: self.settings.private,
        }
    }

    /// Member view.
    pub fn status(&self) -> LobbyStatus {
        LobbyStatus {
            summary: self.summary(),
            players: self.players.clone(),
            ready: self.ready.clone(),
            rtt: self
                .rtt
                .iter()
                .filter_map(|(name, t)| t.smoothed().map(|v| (name.clone(), v)))
                .collect(),
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Every lobby on one server, keyed by id.
#[derive(Debug)]
pub struct LobbyManager {
    lobbies: BTreeMap<String, Lobby>,
    next_id: u64,
    linger_secs: f64,
}

impl LobbyManager {
    /// Empty manager; empty lobbies are removed after `linger_secs`.
    pub fn new(linger_secs: f64) -> Self {
        Self {
            lobbies: BTreeMap::new(),
            next_id: 1,
            linger_secs,
        }
    }

    /// Open a lobby. Ids are sequential decimal strings.
    pub fn create(&mut self, settings: LobbySettings, seed: u64) -> Result<&mut Lobby, LobbyError> {
        if settings.max_players == 0 {
            return Err(LobbyError::ZeroCapacity);
        }
        if settings.max_players > MAX_LOBBY_PLAYERS {
            return Err(LobbyError::CapacityTooLarge {
                requested: settings.max_players,
                max: MAX_LOBBY_PLAYERS,
            });
        }
        let id = self.next_id.to_string();
        self.next_id += 1;
        info!(lobby = %id, name = %settings.name, max_players = settings.max_players, "lobby created");
        Ok(self.lobbies.entry(id.clone()).or_insert_with(|| Lobby::new(id, settings, seed)))
    }

    /// Lookup.
    pub fn get(&self, id: &str) -> Result<&Lobby, LobbyError> {
        self.lobbies.get(id).ok_or_else(|| LobbyError::NotFound(id.to_string()))
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, id: &str) -> Result<&mut Lobby, LobbyError> {
        self.lobbies
            .get_mut(id)
            .ok_or_else(|| LobbyError::NotFound(id.to_string()))
    }

    /// Tear a lobby down.
    pub fn remove(&mut self, id: &str) -> Option<Lobby> {
        let removed = self.lobbies.remove(id);
        if removed.is_some() {
            info!(lobby = id, "lobby removed");
        }
        removed
    }

    /// Public lobbies in id order.
    pub fn list(&self) -> Vec<LobbySummary> {
        self.lobbies
            .values()
            .filter(|l| !l.settings.private)
            .map(Lobby::summary)
            .collect()
    }

    /// Number of lobbies.
    pub fn len(&self) -> usize {
        self.lobbies.len()
    }

    /// No lobbies.
    pub fn is_empty(&self) -> bool {
        self.lobbies.is_empty()
    }

    /// Players across all lobbies.
    pub fn total_players(&self) -> usize {
        self.lobbies.values().map(Lobby::cur_players).sum()
    }

    /// Remove lobbies that have been empty for longer than the linger
    /// period. Returns their ids.
    pub fn sweep(&mut self, now: f64) -> Vec<String> {
        let linger = self.linger_secs;
        let mut expired = Vec::new();
        for (id, lobby) in self.lobbies.iter_mut() {
            if !lobby.is_empty() {
                lobby.empty_since = None;
                continue;
            }
            let since = *lobby.empty_since.get_or_insert(now);
            if now - since > linger {
                expired.push(id.clone());
            }
        }
        for id in &expired {
            self.lobbies.remove(id);
            info!(lobby = %id, "empty lobby expired");
        }
        expired
    }
}

// =============================================================================
// TESTS
// =============================================================================
