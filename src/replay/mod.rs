//! Replays
//!
//! A replay is a line-oriented log: header, meta, then one JSON event per
//! line, with periodic full-state checkpoints so playback can seek without
//! starting from turn zero. An optional trailing line carries an HMAC over
//! everything before it.
//!
//! - [`format`]: line types
//! - [`storage`]: plain/gzip files and the signature trailer
//! - [`recorder`]: writing a replay during a match
//! - [`player`]: loading, indexing and seeking

pub mod format;
pub mod player;
pub mod recorder;
pub mod storage;

use thiserror::Error;

use crate::game::state::MoveError;
use crate::game::validate::StateViolation;

pub use format::{ReplayEvent, ReplayHeader, ReplayMeta, FORMAT_VERSION};
pub use player::ReplayPlayer;
pub use recorder::Recorder;

/// Replay failure.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// Filesystem failure.
    #[error("replay I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line is not the JSON it should be.
    #[error("replay line {line} is malformed: {source}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// Line could not be encoded.
    #[error("replay encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// File ends before header and meta.
    #[error("replay is missing its header or meta line")]
    Truncated,

    /// Header names a newer format.
    #[error("replay format {0} is not supported")]
    UnsupportedFormat(u32),

    /// Trailing signature does not match the content.
    #[error("replay signature verification failed")]
    Verification,

    /// No checkpoint at or before the requested turn.
    #[error("no checkpoint at or before turn {0}")]
    NoCheckpoint(u32),

    /// A checkpoint holds an invalid state.
    #[error("checkpoint state is invalid: {0}")]
    InvalidCheckpoint(#[from] StateViolation),

    /// Re-simulating recorded actions failed.
    #[error("recorded action at turn {turn} no longer applies: {source}")]
    Diverged {
        /// Turn of the failing event.
        turn: u32,
        /// Simulation error.
        #[source]
        source: MoveError,
    },

    /// Recording already stopped.
    #[error("recorder is stopped")]
    Stopped,
}
