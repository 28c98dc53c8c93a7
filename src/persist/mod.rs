//! Persistence
//!
//! - [`save`]: versioned save documents, atomic writes, shadow backups
//! - [`migrate`]: ordered upgrade chain for old documents
//! - [`conflict`]: local vs. cloud reconciliation with an audit trail

pub mod conflict;
pub mod migrate;
pub mod save;

pub use conflict::{read_local_meta, resolve, Choice, ConflictError, ConflictPolicy, ConflictResolver};
pub use migrate::{MigrationChain, MigrationError, CURRENT_SAVE_VERSION};
pub use save::{load, save, LoadedSave, SaveDocument, SaveError, SaveMeta, SaveOptions, SaveOutcome, Saver};
