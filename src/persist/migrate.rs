//! Save Migrations
//!
//! Old documents are upgraded one version at a time by pure functions over
//! the raw JSON, keyed by the version they upgrade from. Steps are never
//! skipped: a missing link in the chain fails the load.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

/// Version written by this build.
pub const CURRENT_SAVE_VERSION: u32 = 3;

/// One upgrade step: a document at version `n` in, version `n + 1` out.
pub type Migration = fn(Value) -> Result<Value, MigrationError>;

/// Upgrade failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MigrationError {
    /// Document is newer than this build understands.
    #[error("save version {found} is not supported (newest known is {supported})")]
    UnsupportedVersion {
        /// Version in the document.
        found: u32,
        /// Newest version this build reads.
        supported: u32,
    },

    /// No step registered for this source version.
    #[error("no migration available for save version {0}")]
    MissingMigration(u32),

    /// A step produced something other than the next version.
    #[error("migration from version {from} produced version {produced}")]
    BadStep {
        /// Source version.
        from: u32,
        /// Version found afterwards.
        produced: u32,
    },

    /// Document shape did not match the step's expectations.
    #[error("cannot migrate document: {0}")]
    Malformed(String),
}

/// Ordered set of upgrade steps.
#[derive(Clone, Debug, Default)]
pub struct MigrationChain {
    steps: BTreeMap<u32, Migration>,
}

impl MigrationChain {
    /// Empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain with every step this build knows about.
    pub fn standard() -> Self {
        let mut chain = Self::new();
        chain.register(1, v1_to_v2);
        chain.register(2, v2_to_v3);
        chain
    }

    /// Register the step upgrading `from` to `from + 1`.
    pub fn register(&mut self, from: u32, step: Migration) {
        self.steps.insert(from, step);
    }

    /// Upgrade `doc` until it reaches `target`.
    pub fn migrate(&self, mut doc: Value, target: u32) -> Result<Value, MigrationError> {
        let mut version = version_of(&doc)?;
        if version > target {
            return Err(MigrationError::UnsupportedVersion {
                found: version,
                supported: target,
            });
        }

        while version < target {
            let step = self
                .steps
                .get(&version)
                .ok_or(MigrationError::MissingMigration(version))?;
            doc = step(doc)?;
            let produced = version_of(&doc)?;
            if produced != version + 1 {
                return Err(MigrationError::BadStep {
                    from: version,
                    produced,
                });
            }
            debug!(from = version, to = produced, "save migration step applied");
            version = produced;
        }
        Ok(doc)
    }
}

fn version_of(doc: &Value) -> Result<u32, MigrationError> {
    // documents from before versioning count as version 1
    match doc.get("save_version") {
        None => Ok(1),
        Some(v) => v
            .as_u64()
            .map(|v| v as u32)
            .ok_or_else(|| MigrationError::Malformed("save_version is not an integer".into())),
    }
}

fn into_object(doc: Value) -> Result<Map<String, Value>, MigrationError> {
    match doc {
        Value::Object(map) => Ok(map),
        _ => Err(MigrationError::Malformed("document is not an object".into())),
    }
}

/// v1 stored a single `player` and no mode.
fn v1_to_v2(doc: Value) -> Result<Value, MigrationError> {
    let mut old = into_object(doc)?;
    let player = old
        .remove("player")
        .ok_or_else(|| MigrationError::Malformed("v1 save has no player".into()))?;

    let mut new = Map::new();
    new.insert("save_version".into(), json!(2));
    new.insert("mode".into(), json!("SOLO"));
    new.insert("players".into(), json!([player]));
    new.insert("state".into(), old.remove("state").unwrap_or_else(|| json!({})));
    for key in ["rng", "meta"] {
        if let Some(v) = old.remove(key) {
            new.insert(key.into(), v);
        }
    }
    Ok(Value::Object(new))
}

/// v2 called enemies `zombies` and had no visibility set.
fn v2_to_v3(doc: Value) -> Result<Value, MigrationError> {
    let mut doc = into_object(doc)?;
    let state = doc
        .get_mut("state")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| MigrationError::Malformed("v2 save has no state object".into()))?;

    let enemies = state.remove("zombies").unwrap_or_else(|| json!([]));
    state.entry("enemies").or_insert(enemies);
    if let Some(board) = state.get_mut("board").and_then(Value::as_object_mut) {
        board.entry("visible").or_insert_with(|| json!([]));
    }

    doc.insert("save_version".into(), json!(3));
    Ok(Value::Object(doc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v1() -> Value {
        json!({
            "save_version": 1,
            "player": {"id": 0, "name": "Ash"},
            "state": {"zombies": [{"id": 0}], "board": {}},
            "rng": {"seed": 1, "state": [1, 2]}
        })
    }

    #[test]
    fn test_v1_to_current() {
        let doc = MigrationChain::standard().migrate(v1(), CURRENT_SAVE_VERSION).unwrap();
        assert_eq!(doc["save_version"], 3);
        assert_eq!(doc["mode"], "SOLO");
        assert_eq!(doc["players"].as_array().unwrap().len(), 1);
        assert!(doc.get("player").is_none());
        assert_eq!(doc["state"]["enemies"][0]["id"], 0);
        assert!(doc["state"].get("zombies").is_none());
        assert_eq!(doc["state"]["board"]["visible"], json!([]));
        assert_eq!(doc["rng"]["seed"], 1);
    }

    #[test]
    fn test_unversioned_counts_as_v1() {
        let mut doc = v1();
        doc.as_object_mut().unwrap().remove("save_version");
        let doc = MigrationChain::standard().migrate(doc, 2).unwrap();
        assert_eq!(doc["save_version"], 2);
    }

    #[test]
    fn test_missing_step_fails() {
        let mut chain = MigrationChain::new();
        chain.register(1, v1_to_v2);
        assert_eq!(
            chain.migrate(v1(), 3).unwrap_err(),
            MigrationError::MissingMigration(2)
        );
    }

    #[test]
    fn test_newer_version_fails() {
        let err = MigrationChain::standard()
            .migrate(json!({"save_version": 4}), CURRENT_SAVE_VERSION)
            .unwrap_err();
        assert_eq!(
            err,
            MigrationError::UnsupportedVersion { found: 4, supported: 3 }
        );
    }

    #[test]
    fn test_step_must_advance_by_one() {
        fn skip(mut doc: Value) -> Result<Value, MigrationError> {
            doc["save_version"] = json!(3);
            Ok(doc)
        }
        let mut chain = MigrationChain::new();
        chain.register(1, skip);
        assert_eq!(
            chain.migrate(v1(), 3).unwrap_err(),
            MigrationError::BadStep { from: 1, produced: 3 }
        );
    }

    #[test]
    fn test_v1_without_player_is_malformed() {
        let err = MigrationChain::standard()
            .migrate(json!({"save_version": 1}), 2)
            .unwrap_err();
        assert!(matches!(err, MigrationError::Malformed(_)));
    }
}
