//! Replay Recording
//!
//! Streams a replay to disk as the match runs. The header and meta are the
//! first two lines; every action follows as one line, with a checkpoint
//! every [`CHECKPOINT_INTERVAL`] turns (or whenever the caller asks).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::core::rng::DeterministicRng;
use crate::game::action::Action;
use crate::game::state::GameState;
use crate::replay::format::{ReplayEvent, ReplayHeader, ReplayMeta};
use crate::replay::storage::LineWriter;
use crate::replay::ReplayError;

/// Turns between automatic checkpoints.
pub const CHECKPOINT_INTERVAL: u32 = 10;

/// Live replay writer.
pub struct Recorder {
    path: PathBuf,
    writer: Option<LineWriter>,
    events: usize,
    last_checkpoint: Option<u32>,
}

impl Recorder {
    /// Create the file and write header and meta.
    ///
    /// A `.gz` path records compressed; a `key` appends a signature on stop.
    pub fn start(path: impl Into<PathBuf>, meta: &ReplayMeta, key: Option<&[u8]>) -> Result<Self, ReplayError> {
        let path = path.into();
        let mut writer = LineWriter::create(&path, key)?;
        writer.write_line(&serde_json::to_string(&ReplayHeader::default())?)?;
        writer.write_line(&serde_json::to_string(meta)?)?;

        info!(path = %path.display(), seed = meta.seed, signed = key.is_some(), "replay recording started");
        Ok(Self {
            path,
            writer: Some(writer),
            events: 0,
            last_checkpoint: None,
        })
    }

    /// Append one event line.
    pub fn record(&mut self, event: &ReplayEvent) -> Result<(), ReplayError> {
        let writer = self.writer.as_mut().ok_or(ReplayError::Stopped)?;
        writer.write_line(&serde_json::to_string(event)?)?;
        self.events += 1;
        Ok(())
    }

    /// Record an action applied by `player` during `turn`.
    pub fn record_action(&mut self, turn: u32, player: usize, action: Action) -> Result<(), ReplayError> {
        self.record(&ReplayEvent::from_action(turn, player, action))
    }

    /// Append a full snapshot tagged with the state's turn.
    pub fn checkpoint(&mut self, state: &GameState, rng: &DeterministicRng) -> Result<(), ReplayError> {
        let event = ReplayEvent::Checkpoint {
            turn: state.turn,
            state: Box::new(state.clone()),
            rng: rng.state(),
        };
        self.record(&event)?;
        self.last_checkpoint = Some(state.turn);
        debug!(turn = state.turn, "replay checkpoint");
        Ok(())
    }

    /// Checkpoint if none exists for this interval yet. Returns whether one
    /// was written.
    pub fn checkpoint_if_due(&mut self, state: &GameState, rng: &DeterministicRng) -> Result<bool, ReplayError> {
        let due = match self.last_checkpoint {
            None => true,
            Some(last) => state.turn >= last + CHECKPOINT_INTERVAL,
        };
        if due {
            self.checkpoint(state, rng)?;
        }
        Ok(due)
    }

    /// Events written so far, excluding header and meta.
    pub fn event_count(&self) -> usize {
        self.events
    }

    /// Current file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Finish the file, optionally moving it to `dest`. Returns the final
    /// location. Compression follows the path given to [`Recorder::start`].
    pub fn stop(&mut self, dest: Option<&Path>) -> Result<PathBuf, ReplayError> {
        let writer = self.writer.take().ok_or(ReplayError::Stopped)?;
        writer.finish()?;

        if let Some(dest) = dest {
            if let Some(dir) = dest.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            if fs::rename(&self.path, dest).is_err() {
                // rename fails across filesystems
                fs::copy(&self.path, dest)?;
                fs::remove_file(&self.path)?;
            }
            self.path = dest.to_path_buf();
        }

        info!(path = %self.path.display(), events = self.events, "replay recording stopped");
        Ok(self.path.clone())
    }
}
