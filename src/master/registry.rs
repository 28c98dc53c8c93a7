//! Server Registry
//!
//! Directory of live game servers. Entries are refreshed by heartbeats and
//! dropped once `now - last_seen` exceeds the timeout. Expiry is lazy: it
//! runs at the start of every heartbeat and list, so an entry is never
//! removed earlier than the timeout allows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::clock::SharedClock;

/// Default entry timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 45.0;

/// Registry failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Id was never issued, was unregistered, or has expired.
    #[error("unknown server_id {0}")]
    UnknownServer(String),
}

/// What a game server advertises about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbyInfo {
    /// Reachable host.
    pub host: String,
    /// Reachable port.
    pub port: u16,
    /// Display name.
    pub name: String,
    /// Mode label.
    #[serde(default)]
    pub mode: String,
    /// Capacity.
    #[serde(default)]
    pub max_players: u32,
    /// Players connected.
    #[serde(default)]
    pub cur_players: u32,
    /// Region label.
    #[serde(default)]
    pub region: String,
    /// Build id.
    #[serde(default)]
    pub build: String,
    /// Game protocol version.
    #[serde(default)]
    pub protocol: u32,
}

/// A registered server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Opaque id issued at registration.
    pub server_id: String,
    /// Advertised details.
    #[serde(flatten)]
    pub info: LobbyInfo,
    /// Last registration or heartbeat, unix seconds.
    pub last_seen: f64,
}

/// Listing filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    /// Exact mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Exact region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Exact build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

impl ListFilter {
    fn matches(&self, info: &LobbyInfo) -> bool {
        let eq = |want: &Option<String>, have: &str| want.as_deref().map_or(true, |w| w == have);
        eq(&self.mode, &info.mode) && eq(&self.region, &info.region) && eq(&self.build, &info.build)
    }
}

/// The directory.
pub struct MasterRegistry {
    entries: BTreeMap<String, ServerEntry>,
    timeout: f64,
    clock: SharedClock,
}

impl MasterRegistry {
    /// Empty registry expiring entries after `timeout` seconds.
    pub fn new(timeout: f64, clock: SharedClock) -> Self {
        Self {
            entries: BTreeMap::new(),
            timeout,
            clock,
        }
    }

    /// Add a server; returns its fresh id.
    pub fn register(&mut self, info: LobbyInfo) -> String {
        let server_id = Uuid::new_v4().simple().to_string();
        info!(%server_id, host = %info.host, port = info.port, name = %info.name, "server registered");
        self.entries.insert(
            server_id.clone(),
            ServerEntry {
                server_id: server_id.clone(),
                info,
                last_seen: self.clock.now(),
            },
        );
        server_id
    }

    /// Refresh liveness and player count.
    pub fn heartbeat(&mut self, server_id: &str, cur_players: u32) -> Result<(), RegistryError> {
        self.purge();
        let now = self.clock.now();
        let entry = self
            .entries
            .get_mut(server_id)
            .ok_or_else(|| RegistryError::UnknownServer(server_id.to_string()))?;
        entry.last_seen = now;
        entry.info.cur_players = cur_players;
        debug!(server_id, cur_players, "heartbeat");
        Ok(())
    }

    /// Remove immediately. Returns whether the id was present.
    pub fn unregister(&mut self, server_id: &str) -> bool {
        let removed = self.entries.remove(server_id).is_some();
        if removed {
            info!(server_id, "server unregistered");
        }
        removed
    }

    /// Live servers matching `filter`, at most `limit` of them.
    pub fn list(&mut self, filter: &ListFilter, limit: Option<usize>) -> Vec<ServerEntry> {
        self.purge();
        self.entries
            .values()
            .filter(|e| filter.matches(&e.info))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Drop expired entries. Returns how many went.
    pub fn purge(&mut self) -> usize {
        let now = self.clock.now();
        let timeout = self.timeout;
        let before = self.entries.len();
        self.entries.retain(|id, e| {
            let keep = now - e.last_seen <= timeout;
            if !keep {
                info!(server_id = %id, idle = now - e.last_seen, "server entry expired");
            }
            keep
        });
        before - self.entries.len()
    }

    /// Entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
