//! Save Conflict Resolution
//!
//! Decides between a local and a cloud copy of the same save slot. The
//! decision itself is pure; [`ConflictResolver`] wraps it with an
//! append-only JSON-lines audit log holding both metadata records.
//!
//! Under [`ConflictPolicy::Ask`] the answer is only a suggestion (the newer
//! copy). Whoever drives the UI still owns the final choice.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::core::clock::{Clock, SharedClock};
use crate::core::hash::sha256_hex;
use crate::persist::save::SaveMeta;

/// Conflict handling failure.
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Reading a save or writing the audit log failed.
    #[error("conflict I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Audit entry could not be encoded.
    #[error("conflict log encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Unknown policy name.
    #[error("unknown save conflict policy {0:?}")]
    UnknownPolicy(String),
}

/// How to settle diverging copies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Suggest the newer copy and let the user confirm.
    #[default]
    Ask,
    /// Always keep the local copy.
    PreferLocal,
    /// Always take the cloud copy.
    PreferCloud,
}

impl FromStr for ConflictPolicy {
    type Err = ConflictError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ask" => Ok(Self::Ask),
            "prefer_local" => Ok(Self::PreferLocal),
            "prefer_cloud" => Ok(Self::PreferCloud),
            other => Err(ConflictError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Which copy wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Choice {
    /// Keep the local file.
    Local,
    /// Take the cloud file.
    Cloud,
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Choice::Local => "local",
            Choice::Cloud => "cloud",
        })
    }
}

/// Pick a copy. Identical content always keeps the local file; ties on
/// modification time under `Ask` also favour local.
pub fn resolve(local: &SaveMeta, cloud: &SaveMeta, policy: ConflictPolicy) -> Choice {
    if !local.sha256.is_empty() && local.sha256 == cloud.sha256 {
        return Choice::Local;
    }
    match policy {
        ConflictPolicy::PreferLocal => Choice::Local,
        ConflictPolicy::PreferCloud => Choice::Cloud,
        ConflictPolicy::Ask if local.modified >= cloud.modified => Choice::Local,
        ConflictPolicy::Ask => Choice::Cloud,
    }
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    ts: f64,
    policy: ConflictPolicy,
    choice: Choice,
    local: &'a SaveMeta,
    cloud: &'a SaveMeta,
}

/// [`resolve`] plus an audit trail.
pub struct ConflictResolver {
    policy: ConflictPolicy,
    log_path: PathBuf,
    clock: SharedClock,
}

impl ConflictResolver {
    /// Resolver appending to `log_path`.
    pub fn new(policy: ConflictPolicy, log_path: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self {
            policy,
            log_path: log_path.into(),
            clock,
        }
    }

    /// Configured policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Decide, then append `{ts, policy, choice, local, cloud}` to the log.
    pub fn resolve(&self, local: &SaveMeta, cloud: &SaveMeta) -> Result<Choice, ConflictError> {
        let choice = resolve(local, cloud, self.policy);
        let entry = AuditEntry {
            ts: self.clock.now(),
            policy: self.policy,
            choice,
            local,
            cloud,
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        if let Some(dir) = self.log_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        file.write_all(&line)?;

        info!(policy = ?self.policy, %choice, "save conflict resolved");
        Ok(choice)
    }
}

/// Metadata of a local save, filling gaps from the file itself.
///
/// Fields missing from the embedded meta block (or a file that is not a
/// save document at all) fall back to filesystem timestamps, the raw byte
/// length and the SHA-256 of the raw bytes.
pub fn read_local_meta(path: &Path) -> Result<SaveMeta, ConflictError> {
    let raw = fs::read(path)?;
    let stat = fs::metadata(path)?;

    let embedded = serde_json::from_slice::<serde_json::Value>(&raw)
        .ok()
        .and_then(|doc| doc.get("meta").cloned())
        .unwrap_or(serde_json::Value::Null);
    let field = |key: &str| embedded.get(key).filter(|v| !v.is_null());

    let modified = stat.modified().ok().map(unix_secs).unwrap_or(0.0);
    let created = stat.created().ok().map(unix_secs).unwrap_or(modified);

    Ok(SaveMeta {
        created: field("created").and_then(|v| v.as_f64()).unwrap_or(created),
        modified: field("modified").and_then(|v| v.as_f64()).unwrap_or(modified),
        duration: field("duration").and_then(|v| v.as_u64()).unwrap_or(0),
        turn: field("turn").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        seed: field("seed").and_then(|v| v.as_u64()).unwrap_or(0),
        size: field("size").and_then(|v| v.as_u64()).unwrap_or(raw.len() as u64),
        sha256: field("sha256")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| sha256_hex(&raw)),
    })
}

fn unix_secs(t: std::time::SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    fn meta(sha: &str, modified: f64) -> SaveMeta {
        SaveMeta {
            modified,
            sha256: sha.to_string(),
            ..SaveMeta::default()
        }
    }

    #[test]
    fn test_equal_hashes_keep_local() {
        let local = meta("abc", 1.0);
        let cloud = meta("abc", 5.0);
        for policy in [ConflictPolicy::Ask, ConflictPolicy::PreferCloud, ConflictPolicy::PreferLocal] {
            assert_eq!(resolve(&local, &cloud, policy), Choice::Local);
        }
    }

    #[test]
    fn test_policies() {
        let local = meta("a", 10.0);
        let cloud = meta("b", 5.0);
        assert_eq!(resolve(&local, &cloud, ConflictPolicy::PreferCloud), Choice::Cloud);
        assert_eq!(resolve(&local, &cloud, ConflictPolicy::PreferLocal), Choice::Local);
        assert_eq!(resolve(&local, &cloud, ConflictPolicy::Ask), Choice::Local);
        assert_eq!(resolve(&cloud, &local, ConflictPolicy::Ask), Choice::Cloud);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("prefer_cloud".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::PreferCloud);
        assert!("newest".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn test_resolver_writes_audit_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("conflict.log");
        let resolver = ConflictResolver::new(ConflictPolicy::Ask, &log, ManualClock::new(42.0));

        resolver.resolve(&meta("a", 1.0), &meta("b", 2.0)).unwrap();
        resolver.resolve(&meta("a", 3.0), &meta("b", 2.0)).unwrap();

        let text = fs::read_to_string(&log).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["choice"], "cloud");
        assert_eq!(lines[1]["choice"], "local");
        assert_eq!(lines[0]["ts"], 42.0);
        assert_eq!(lines[0]["local"]["sha256"], "a");
    }

    #[test]
    fn test_read_local_meta_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.json");
        fs::write(&path, b"{\"meta\": {\"turn\": 3}}").unwrap();

        let meta = read_local_meta(&path).unwrap();
        assert_eq!(meta.turn, 3);
        assert_eq!(meta.size, 21);
        assert_eq!(meta.sha256, sha256_hex(b"{\"meta\": {\"turn\": 3}}"));
        assert!(meta.modified > 0.0);
    }
}
