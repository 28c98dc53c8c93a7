//! Game Rooms
//!
//! The authoritative per-match state on the server. A room is created next
//! to its lobby, issues each joining player a stable slot and a rejoin
//! token, and once started owns the [`GameState`] and the generator that
//! drives it. Actions arrive as raw field maps: they are checked against a
//! whitelist, then against the room-wide sequence counter (strictly
//! gapless), and only then applied. A rejected action leaves the room
//! untouched.

use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::rng::DeterministicRng;
use crate::game::action::{Action, Direction};
use crate::game::state::{CreateError, GameMode, GameState, MoveError};
use crate::network::lobby::{Lobby, LobbySettings, MAX_LOBBY_PLAYERS};
use crate::replay::recorder::Recorder;
use crate::replay::ReplayError;

/// Fields an `ACTION` message may carry.
pub const ACTION_FIELDS: [&str; 3] = ["seq", "move", "end_turn"];

/// Room operation failure. The room is unchanged when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    /// Action fields outside the whitelist or with bad values.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Sequence number is not the next expected one.
    #[error("bad sequence number {got} (expected {expected})")]
    BadSequence {
        /// Next expected.
        expected: u64,
        /// Supplied.
        got: u64,
    },

    /// Match not running yet.
    #[error("match has not started")]
    NotStarted,

    /// Match already running.
    #[error("match already started")]
    AlreadyStarted,

    /// Some lobby member is not ready.
    #[error("not every player is ready")]
    NotReady,

    /// Another player holds the turn.
    #[error("slot {slot} cannot act: it is not their turn")]
    NotYourTurn {
        /// Acting slot.
        slot: usize,
    },

    /// No such slot.
    #[error("unknown slot {0}")]
    UnknownSlot(usize),

    /// No slot for that name.
    #[error("unknown player {0}")]
    UnknownPlayer(String),

    /// Name already holds a slot.
    #[error("{0} already holds a slot; rejoin instead")]
    DuplicatePlayer(String),

    /// Token does not match the slot.
    #[error("invalid rejoin token for {0}")]
    BadToken(String),

    /// Late joins are switched off.
    #[error("match in progress and drop-in is disabled")]
    DropInDisabled,

    /// Spectating is switched off.
    #[error("spectators are not allowed")]
    SpectatorsDisabled,

    /// Board has no room for another player.
    #[error("no free cell for another player")]
    Full,

    /// Simulation refused the move.
    #[error("illegal move: {0}")]
    IllegalMove(#[from] MoveError),

    /// Match could not be set up.
    #[error("cannot create match: {0}")]
    Create(#[from] CreateError),
}

/// Match parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomConfig {
    /// Board width.
    pub width: u32,
    /// Board height.
    pub height: u32,
    /// Enemies at start.
    pub enemies: usize,
    /// Late joins allowed.
    pub allow_drop_in: bool,
    /// Spectators allowed.
    pub allow_spectators: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            width: MAX_LOBBY_PLAYERS as u32,
            height: MAX_LOBBY_PLAYERS as u32,
            enemies: 3,
            allow_drop_in: false,
            allow_spectators: true,
        }
    }
}

impl RoomConfig {
    /// Defaults with the lobby's join policy.
    pub fn for_lobby(settings: &LobbySettings) -> Self {
        Self {
            allow_drop_in: settings.allow_drop_in,
            allow_spectators: settings.allow_spectators,
            ..Self::default()
        }
    }
}

/// Slot and token handed to a player on join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatGrant {
    /// Stable slot index.
    pub slot: usize,
    /// Opaque rejoin credential.
    pub token: String,
}

/// An applied action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedAction {
    /// Sequence number it was applied under.
    pub seq: u64,
    /// Acting slot.
    pub slot: usize,
    /// The action.
    pub action: Action,
    /// Room tick after applying.
    pub tick: u64,
}

/// Full room view, sent on `STATE` and on rejoin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    /// Lobby id.
    pub room: String,
    /// Actions applied so far.
    pub tick: u64,
    /// Next accepted sequence number.
    pub next_seq: u64,
    /// Whether the match is running.
    pub started: bool,
    /// Simulation state once started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Box<GameState>>,
}

#[derive(Debug, Clone)]
struct Slot {
    name: String,
    token: String,
    connected: bool,
    player: Option<usize>,
}

/// Authoritative match state for one lobby.
pub struct GameRoom {
    lobby_id: String,
    seed: u64,
    config: RoomConfig,
    rng: DeterministicRng,
    game: Option<GameState>,
    tick: u64,
    next_seq: u64,
    log: Vec<LoggedAction>,
    slots: Vec<Slot>,
    spectators: Vec<String>,
    recorder: Option<Recorder>,
}

/// Check an `ACTION` field map against the whitelist.
///
/// `seq` is required, and exactly one of `move` (a direction letter) or
/// `end_turn` (`true`) must be present. Nothing else may appear.
pub fn validate_action(fields: &Map<String, Value>) -> Result<(u64, Action), RoomError> {
    if let Some(extra) = fields.keys().find(|k| !ACTION_FIELDS.contains(&k.as_str())) {
        return Err(RoomError::InvalidAction(format!("unexpected field '{extra}'")));
    }
    let seq = fields
        .get("seq")
        .ok_or_else(|| RoomError::InvalidAction("missing 'seq'".into()))?
        .as_u64()
        .ok_or_else(|| RoomError::InvalidAction("'seq' must be a non-negative integer".into()))?;

    let action = match (fields.get("move"), fields.get("end_turn")) {
        (Some(dir), None) => {
            let letter = dir
                .as_str()
                .ok_or_else(|| RoomError::InvalidAction("'move' must be a string".into()))?;
            let dir: Direction = letter
                .parse()
                .map_err(|e: crate::game::action::UnknownDirection| RoomError::InvalidAction(e.to_string()))?;
            Action::Move(dir)
        }
        (None, Some(Value::Bool(true))) => Action::EndTurn,
        (None, Some(_)) => return Err(RoomError::InvalidAction("'end_turn' must be true".into())),
        (Some(_), Some(_)) => return Err(RoomError::InvalidAction("one action per message".into())),
        (None, None) => return Err(RoomError::InvalidAction("no action given".into())),
    };
    Ok((seq, action))
}

fn new_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl GameRoom {
    /// Room for `lobby_id`, not yet started.
    pub fn new(lobby_id: impl Into<String>, seed: u64, config: RoomConfig) -> Self {
        Self {
            lobby_id: lobby_id.into(),
            seed,
            config,
            rng: DeterministicRng::new(seed),
            game: None,
            tick: 0,
            next_seq: 1,
            log: Vec::new(),
            slots: Vec::new(),
            spectators: Vec::new(),
            recorder: None,
        }
    }

    /// Lobby id.
    pub fn lobby_id(&self) -> &str {
        &self.lobby_id
    }

    /// Match seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Whether the match is running.
    pub fn is_started(&self) -> bool {
        self.game.is_some()
    }

    /// Simulation state once started.
    pub fn game(&self) -> Option<&GameState> {
        self.game.as_ref()
    }

    /// Actions applied so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Next accepted sequence number.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Applied actions in order.
    pub fn log(&self) -> &[LoggedAction] {
        &self.log
    }

    /// Record the match to `recorder` from the next start onwards.
    pub fn attach_recorder(&mut self, recorder: Recorder) {
        self.recorder = Some(recorder);
    }

    /// Finish the recording, if any.
    pub fn stop_recording(&mut self, dest: Option<&Path>) -> Option<Result<PathBuf, ReplayError>> {
        let mut recorder = self.recorder.take()?;
        Some(recorder.stop(dest))
    }

    /// Start the match if every lobby member is ready.
    ///
    /// Lobby members become simulation players in join order.
    pub fn start(&mut self, lobby: &Lobby) -> Result<(), RoomError> {
        if self.game.is_some() {
            return Err(RoomError::AlreadyStarted);
        }
        if !lobby.all_ready() {
            return Err(RoomError::NotReady);
        }

        let names = lobby.players();
        let mut rng = DeterministicRng::new(self.seed);
        let mut game = GameState::create(self.config.width, self.config.height, names.len(), self.config.enemies, &mut rng)?
            .with_mode(GameMode::Online);
        for (player, name) in game.players.iter_mut().zip(names) {
            player.name = name.clone();
        }
        for slot in &mut self.slots {
            slot.player = names.iter().position(|n| *n == slot.name);
        }

        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.checkpoint(&game, &rng) {
                warn!(room = %self.lobby_id, error = %e, "replay checkpoint failed");
            }
        }

        info!(room = %self.lobby_id, players = names.len(), seed = self.seed, "match started");
        self.rng = rng;
        self.game = Some(game);
        Ok(())
    }

    /// Validate and apply one action from `slot`.
    pub fn apply_action(&mut self, fields: &Map<String, Value>, slot: usize) -> Result<LoggedAction, RoomError> {
        let (seq, action) = validate_action(fields)?;
        if seq != self.next_seq {
            debug!(room = %self.lobby_id, expected = self.next_seq, got = seq, "out of sequence action");
            return Err(RoomError::BadSequence {
                expected: self.next_seq,
                got: seq,
            });
        }

        let player = self
            .slots
            .get(slot)
            .ok_or(RoomError::UnknownSlot(slot))?
            .player;
        let game = self.game.as_mut().ok_or(RoomError::NotStarted)?;
        let player = player.ok_or(RoomError::NotYourTurn { slot })?;
        if game.active != player {
            return Err(RoomError::NotYourTurn { slot });
        }

        let turn = game.turn;
        game.apply(action, &mut self.rng)?;

        self.tick += 1;
        self.next_seq += 1;
        let entry = LoggedAction {
            seq,
            slot,
            action,
            tick: self.tick,
        };
        self.log.push(entry.clone());

        #[cfg(feature = "debug-tracing")]
        {
            match game.compute_hash() {
                Ok(hash) => tracing::trace!(room = %self.lobby_id, tick = self.tick, hash = %hex::encode(hash), "state after action"),
                Err(e) => tracing::trace!(room = %self.lobby_id, tick = self.tick, error = %e, "state hash unavailable"),
            }
        }

        if let Some(recorder) = self.recorder.as_mut() {
            let mut result = recorder.record_action(turn, player, action);
            if result.is_ok() && action == Action::EndTurn {
                result = recorder.checkpoint_if_due(game, &self.rng).map(|_| ());
            }
            if let Err(e) = result {
                warn!(room = %self.lobby_id, error = %e, "replay write failed");
            }
        }
        Ok(entry)
    }

    /// Give `name` a slot and rejoin token. After the match has started this
    /// is a drop-in and also seats them in the simulation.
    pub fn add_player(&mut self, name: &str) -> Result<SeatGrant, RoomError> {
        if self.slots.iter().any(|s| s.name == name) {
            return Err(RoomError::DuplicatePlayer(name.to_string()));
        }
        let player = match self.game.as_mut() {
            None => None,
            Some(_) if !self.config.allow_drop_in => return Err(RoomError::DropInDisabled),
            Some(game) => Some(game.add_player(name).ok_or(RoomError::Full)?),
        };

        let grant = SeatGrant {
            slot: self.slots.len(),
            token: new_token(),
        };
        self.slots.push(Slot {
            name: name.to_string(),
            token: grant.token.clone(),
            connected: true,
            player,
        });
        debug!(room = %self.lobby_id, player = name, slot = grant.slot, "slot assigned");
        Ok(grant)
    }

    /// Take `name` off the active roster. The slot and token survive.
    pub fn drop_player(&mut self, name: &str) -> Result<usize, RoomError> {
        let (idx, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.name == name)
            .ok_or_else(|| RoomError::UnknownPlayer(name.to_string()))?;
        slot.connected = false;
        info!(room = %self.lobby_id, player = name, slot = idx, "player dropped");
        Ok(idx)
    }

    /// Restore `name` to the roster if `token` matches their slot.
    pub fn rejoin_player(&mut self, name: &str, token: &str) -> Result<(usize, RoomSnapshot), RoomError> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| RoomError::UnknownPlayer(name.to_string()))?;
        if self.slots[idx].token != token {
            warn!(room = %self.lobby_id, player = name, "rejoin with wrong token");
            return Err(RoomError::BadToken(name.to_string()));
        }
        self.slots[idx].connected = true;
        info!(room = %self.lobby_id, player = name, slot = idx, "player rejoined");
        Ok((idx, self.snapshot()))
    }

    /// Slot held by `name`.
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name == name)
    }

    /// Names currently connected, in slot order.
    pub fn active_roster(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| s.connected)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Attach a spectator.
    pub fn add_spectator(&mut self, name: &str) -> Result<(), RoomError> {
        if !self.config.allow_spectators {
            return Err(RoomError::SpectatorsDisabled);
        }
        if !self.spectators.iter().any(|s| s == name) {
            self.spectators.push(name.to_string());
        }
        Ok(())
    }

    /// Detach a spectator.
    pub fn remove_spectator(&mut self, name: &str) -> bool {
        let before = self.spectators.len();
        self.spectators.retain(|s| s != name);
        before != self.spectators.len()
    }

    /// Spectators in arrival order.
    pub fn spectators(&self) -> &[String] {
        &self.spectators
    }

    /// Current view.
    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room: self.lobby_id.clone(),
            tick: self.tick,
            next_seq: self.next_seq,
            started: self.game.is_some(),
            state: self.game.clone().map(Box::new),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
