//! Save Files
//!
//! A save is one JSON document:
//!
//! ```text
//! {save_version, mode, players[], state, rng{seed,state},
//!  meta{created, modified, duration, turn, seed, size, sha256}}
//! ```
//!
//! `meta.sha256` is the SHA-256 of the compact document with that field set
//! to the empty string, and `meta.size` is the byte length of the final
//! document. Both are embedded in the payload they describe, so they are
//! recomputed until they stop changing before anything touches the disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::clock::{Clock, SystemClock};
use crate::core::hash::sha256_hex;
use crate::core::rng::{DeterministicRng, RngState};
use crate::game::board::Board;
use crate::game::events::GameEvent;
use crate::game::state::{Enemy, GameMode, GameState, Player};
use crate::game::validate::{validate_state, StateViolation};
use crate::persist::migrate::{MigrationChain, MigrationError, CURRENT_SAVE_VERSION};

/// Iterations allowed for size/hash to settle. Three always suffice since
/// only the digit count of `size` can move the length.
const MAX_FIXED_POINT_ROUNDS: usize = 8;

// =============================================================================
// ERRORS
// =============================================================================

/// Save or load failure.
#[derive(Debug, Error)]
pub enum SaveError {
    /// Filesystem failure; on write the original file is untouched.
    #[error("save I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Document is not valid JSON or lacks required fields.
    #[error("malformed save document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// `save_version` is not an integer.
    #[error("save_version is not an integer")]
    BadVersion,

    /// Upgrade chain refused the document.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Embedded hash does not match the content.
    #[error("save content hash mismatch (expected {expected}, found {actual})")]
    Corrupt {
        /// Hash recorded in meta.
        expected: String,
        /// Hash of the content as read.
        actual: String,
    },

    /// Decoded state breaks an invariant.
    #[error("saved state is invalid: {0}")]
    Invalid(#[from] StateViolation),

    /// Size and hash never settled.
    #[error("save metadata did not reach a fixed point")]
    Unstable,
}

// =============================================================================
// DOCUMENT
// =============================================================================

/// Metadata block of a save document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveMeta {
    /// First write, unix seconds.
    pub created: f64,
    /// Latest write, unix seconds.
    pub modified: f64,
    /// Seconds played.
    pub duration: u64,
    /// Turn counter at save time.
    pub turn: u32,
    /// Match seed.
    pub seed: u64,
    /// Byte length of the whole document.
    pub size: u64,
    /// Content hash, see module docs.
    pub sha256: String,
}

/// Everything in `GameState` apart from mode and players, which live at the
/// top level of the document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateBody {
    /// Play field.
    pub board: Board,
    /// Enemies.
    #[serde(default)]
    pub enemies: Vec<Enemy>,
    /// Active player index.
    pub active: usize,
    /// Turn counter.
    pub turn: u32,
    /// Event log.
    #[serde(default)]
    pub log: Vec<GameEvent>,
}

/// On-disk save document at the current version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaveDocument {
    /// Schema version.
    pub save_version: u32,
    /// Match flavour.
    pub mode: GameMode,
    /// Players in turn order.
    pub players: Vec<Player>,
    /// Remaining simulation state.
    pub state: StateBody,
    /// Generator snapshot.
    pub rng: RngState,
    /// Metadata.
    #[serde(default)]
    pub meta: SaveMeta,
}

impl SaveDocument {
    /// Split a state and generator into a document with blank meta.
    pub fn new(state: &GameState, rng: &DeterministicRng) -> Self {
        Self {
            save_version: CURRENT_SAVE_VERSION,
            mode: state.mode,
            players: state.players.clone(),
            state: StateBody {
                board: state.board.clone(),
                enemies: state.enemies.clone(),
                active: state.active,
                turn: state.turn,
                log: state.log.clone(),
            },
            rng: rng.state(),
            meta: SaveMeta::default(),
        }
    }

    /// Reassemble the game state.
    pub fn to_state(&self) -> GameState {
        GameState {
            mode: self.mode,
            board: self.state.board.clone(),
            players: self.players.clone(),
            enemies: self.state.enemies.clone(),
            active: self.state.active,
            turn: self.state.turn,
            log: self.state.log.clone(),
        }
    }

    /// Hash of the document with `meta.sha256` blanked.
    pub fn content_hash(&self) -> Result<String, SaveError> {
        let mut blank = self.clone();
        blank.meta.sha256.clear();
        Ok(sha256_hex(&serde_json::to_vec(&blank)?))
    }

    /// Settle `meta.size` and `meta.sha256` and return the final bytes.
    pub fn seal(&mut self) -> Result<Vec<u8>, SaveError> {
        for round in 0..MAX_FIXED_POINT_ROUNDS {
            self.meta.sha256 = self.content_hash()?;
            let bytes = serde_json::to_vec(self)?;
            if bytes.len() as u64 == self.meta.size {
                debug!(round, size = self.meta.size, "save metadata settled");
                return Ok(bytes);
            }
            self.meta.size = bytes.len() as u64;
        }
        Err(SaveError::Unstable)
    }
}

// =============================================================================
// SAVE
// =============================================================================

/// Result of a save request.
#[derive(Clone, Debug, PartialEq)]
pub enum SaveOutcome {
    /// Document committed with this metadata.
    Written(SaveMeta),
    /// Nothing written: online matches are never persisted.
    Skipped,
}

/// Knobs for [`Saver`].
#[derive(Clone, Debug, Default)]
pub struct SaveOptions {
    /// Root of dated backups; defaults to `<save dir>/backups`.
    pub backup_dir: Option<PathBuf>,
    /// Seconds played so far.
    pub duration: u64,
}

/// Writes and reads save documents.
pub struct Saver<'a> {
    options: SaveOptions,
    clock: &'a dyn Clock,
    migrations: MigrationChain,
}

impl<'a> Saver<'a> {
    /// Saver with the standard migration chain.
    pub fn new(options: SaveOptions, clock: &'a dyn Clock) -> Self {
        Self {
            options,
            clock,
            migrations: MigrationChain::standard(),
        }
    }

    /// Persist `state` and `rng` to `path`.
    ///
    /// Any existing file is first copied into a dated backup directory.
    /// The new document goes to a temporary file in the same directory that
    /// is renamed over `path` only once fully written, so an interrupted
    /// save leaves the original in place.
    pub fn save(&self, state: &GameState, rng: &DeterministicRng, path: &Path) -> Result<SaveOutcome, SaveError> {
        if state.mode == GameMode::Online {
            debug!(path = %path.display(), "online match, skipping save");
            return Ok(SaveOutcome::Skipped);
        }

        let now = self.clock.now();
        let created = previous_created(path).unwrap_or(now);

        let mut doc = SaveDocument::new(state, rng);
        doc.meta = SaveMeta {
            created,
            modified: now,
            duration: self.options.duration,
            turn: state.turn,
            seed: rng.seed(),
            size: 0,
            sha256: String::new(),
        };
        let bytes = doc.seal()?;

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        if path.exists() {
            self.backup(path, &dir, now)?;
        }

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| SaveError::Io(e.error))?;

        info!(
            path = %path.display(),
            turn = doc.meta.turn,
            size = doc.meta.size,
            sha256 = %doc.meta.sha256,
            "save written"
        );
        Ok(SaveOutcome::Written(doc.meta))
    }

    fn backup(&self, path: &Path, dir: &Path, now: f64) -> Result<PathBuf, SaveError> {
        let stamp = chrono::DateTime::from_timestamp_millis((now * 1000.0) as i64).unwrap_or_default();
        let root = self
            .options
            .backup_dir
            .clone()
            .unwrap_or_else(|| dir.join("backups"));
        let day_dir = root.join(stamp.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&day_dir)?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "save.json".to_string());
        let target = day_dir.join(format!("{}.{}", name, stamp.format("%H%M%S%3f")));
        fs::copy(path, &target)?;
        info!(from = %path.display(), to = %target.display(), "shadow backup taken");
        Ok(target)
    }

    /// Read a save, upgrading old versions and verifying current ones.
    pub fn load(&self, path: &Path) -> Result<LoadedSave, SaveError> {
        let raw = fs::read(path)?;
        let value: serde_json::Value = serde_json::from_slice(&raw)?;
        // unversioned documents predate versioning and count as v1
        let version = match value.get("save_version") {
            None => 1,
            Some(v) => v.as_u64().ok_or(SaveError::BadVersion)? as u32,
        };

        let migrated = version != CURRENT_SAVE_VERSION;
        let value = if migrated {
            self.migrations.migrate(value, CURRENT_SAVE_VERSION)?
        } else {
            value
        };
        let doc: SaveDocument = serde_json::from_value(value)?;

        if !migrated && !doc.meta.sha256.is_empty() {
            let actual = doc.content_hash()?;
            if actual != doc.meta.sha256 {
                warn!(path = %path.display(), "save hash mismatch");
                return Err(SaveError::Corrupt {
                    expected: doc.meta.sha256.clone(),
                    actual,
                });
            }
        }

        let state = doc.to_state();
        validate_state(&state)?;
        let rng = DeterministicRng::from_state(doc.rng);

        if migrated {
            info!(path = %path.display(), from = version, to = CURRENT_SAVE_VERSION, "save migrated");
        }
        Ok(LoadedSave {
            state,
            rng,
            meta: doc.meta,
            migrated_from: migrated.then_some(version),
        })
    }
}

/// A decoded save.
#[derive(Clone, Debug)]
pub struct LoadedSave {
    /// Restored state.
    pub state: GameState,
    /// Restored generator, positioned where the save left it.
    pub rng: DeterministicRng,
    /// Stored metadata.
    pub meta: SaveMeta,
    /// Original version when an upgrade ran.
    pub migrated_from: Option<u32>,
}

fn previous_created(path: &Path) -> Option<f64> {
    let raw = fs::read(path).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    value.get("meta")?.get("created")?.as_f64()
}

/// Save with default options and the system clock.
pub fn save(state: &GameState, rng: &DeterministicRng, path: &Path) -> Result<SaveOutcome, SaveError> {
    Saver::new(SaveOptions::default(), &SystemClock).save(state, rng, path)
}

/// Load with the standard migration chain.
pub fn load(path: &Path) -> Result<LoadedSave, SaveError> {
    Saver::new(SaveOptions::default(), &SystemClock).load(path)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::game::action::{Action, Direction};
    use crate::game::state::new_game;
    use serde_json::json;

    fn played() -> (GameState, DeterministicRng) {
        let (mut state, mut rng) = new_game(8, 8, 2, 3, 77).unwrap();
        for action in [
            Action::Move(Direction::Down),
            Action::EndTurn,
            Action::Move(Direction::Down),
            Action::EndTurn,
        ] {
            // enemy placement is random; a blocked step is fine here
            let _ = state.apply(action, &mut rng);
        }
        rng.next_u64();
        (state, rng)
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot1.json");
        let (state, mut rng) = played();

        let outcome = save(&state, &rng, &path).unwrap();
        assert!(matches!(outcome, SaveOutcome::Written(_)));

        let mut loaded = load(&path).unwrap();
        assert_eq!(loaded.state.players, state.players);
        assert_eq!(loaded.state.active, state.active);
        assert_eq!(loaded.state.turn, state.turn);
        assert_eq!(loaded.state.board.noise, state.board.noise);
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.migrated_from, None);

        for _ in 0..10 {
            assert_eq!(loaded.rng.next_u64(), rng.next_u64());
        }
    }

    #[test]
    fn test_meta_is_fixed_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.json");
        let (state, rng) = played();
        let SaveOutcome::Written(meta) = save(&state, &rng, &path).unwrap() else {
            panic!("expected a write");
        };

        let raw = fs::read(&path).unwrap();
        assert_eq!(meta.size, raw.len() as u64);

        let doc: SaveDocument = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc.meta.sha256, doc.content_hash().unwrap());
        assert_eq!(doc.meta.seed, 77);
        assert_eq!(doc.meta.turn, state.turn);
    }

    #[test]
    fn test_online_is_never_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("online.json");
        let (state, rng) = played();
        let state = state.with_mode(GameMode::Online);
        assert_eq!(save(&state, &rng, &path).unwrap(), SaveOutcome::Skipped);
        assert!(!path.exists());
    }

    #[test]
    fn test_backup_before_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.json");
        let clock = ManualClock::new(1_700_000_000.0);
        let saver = Saver::new(SaveOptions::default(), clock.as_ref());
        let (state, rng) = played();

        saver.save(&state, &rng, &path).unwrap();
        let first = fs::read(&path).unwrap();
        clock.advance(60.0);
        let SaveOutcome::Written(meta) = saver.save(&state, &rng, &path).unwrap() else {
            panic!("expected a write");
        };
        assert_eq!(meta.created, 1_700_000_000.0);
        assert_eq!(meta.modified, 1_700_000_060.0);

        let day = dir.path().join("backups").join("2023-11-14");
        let backups: Vec<_> = fs::read_dir(&day).unwrap().collect();
        assert_eq!(backups.len(), 1);
        let copy = fs::read(backups[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(copy, first);
    }

    #[test]
    fn test_tampered_save_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slot.json");
        let (state, rng) = played();
        save(&state, &rng, &path).unwrap();

        let mut doc: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        doc["state"]["turn"] = json!(999);
        fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        assert!(matches!(load(&path), Err(SaveError::Corrupt { .. })));
    }

    #[test]
    fn test_v1_document_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        let v1 = json!({
            "save_version": 1,
            "player": {"id": 0, "name": "Ash", "pos": {"x": 1, "y": 1}, "health": 7, "inventory": []},
            "state": {
                "board": {"width": 3, "height": 3, "tiles": ".........", "noise": []},
                "zombies": [{"id": 0, "pos": {"x": 2, "y": 2}, "health": 3}],
                "active": 0,
                "turn": 4
            },
            "rng": {"seed": 5, "state": [11, 22]}
        });
        fs::write(&path, serde_json::to_vec(&v1).unwrap()).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.migrated_from, Some(1));
        assert_eq!(loaded.state.players.len(), 1);
        assert_eq!(loaded.state.players[0].name, "Ash");
        assert_eq!(loaded.state.mode, GameMode::Solo);
        assert_eq!(loaded.state.enemies.len(), 1);
        assert_eq!(loaded.state.turn, 4);
    }

    #[test]
    fn test_future_version_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.json");
        fs::write(&path, br#"{"save_version": 99}"#).unwrap();
        assert!(matches!(
            load(&path),
            Err(SaveError::Migration(MigrationError::UnsupportedVersion { found: 99, .. }))
        ));
    }

    #[test]
    fn test_invalid_state_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        let (mut state, rng) = played();
        state.active = 7;
        save(&state, &rng, &path).unwrap();
        assert!(matches!(load(&path), Err(SaveError::Invalid(_))));
    }
}
