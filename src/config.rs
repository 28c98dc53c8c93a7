//! Runtime Configuration
//!
//! Flat key/value settings shared by both binaries. Values come either from
//! a dictionary handed over by the embedding application or from `OKO_*`
//! environment variables (`OKO_ACTIONS_PER_SEC=20` sets `actions_per_sec`).
//! Unknown keys are ignored; unparseable values are an error.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tracing::debug;

use crate::master::auth::AuthConfig;
use crate::network::client::Backoff;
use crate::network::security::RateLimits;
use crate::persist::conflict::ConflictPolicy;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "OKO_";

/// Configuration failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value could not be parsed for its key.
    #[error("invalid value for {key}: {value:?}")]
    Invalid {
        /// Setting name.
        key: String,
        /// Raw value.
        value: String,
    },
}

/// All runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Save conflict policy.
    pub save_conflict_policy: ConflictPolicy,
    /// Reconnect delays, seconds.
    pub reconnect_backoff: Vec<u64>,
    /// Per-session action limit.
    pub actions_per_sec: u32,
    /// Per-session byte budget.
    pub bytes_per_min: u32,
    /// Per-session ping limit.
    pub pings_per_sec: u32,
    /// Per-IP master request limit.
    pub master_requests_per_min: u32,
    /// Violations before ban and disconnect; `0` disables escalation.
    pub rate_limit_strikes: u32,
    /// Escalation ban length, seconds.
    pub ban_seconds: u64,
    /// Per-client outgoing queue length.
    pub outbox_capacity: usize,
    /// Server ping cadence, seconds.
    pub ping_interval_secs: u64,
    /// Silence before a connection is dropped, seconds.
    pub idle_timeout_secs: u64,
    /// Empty lobby retention, seconds.
    pub lobby_linger_secs: u64,
    /// Master entry timeout, seconds.
    pub registry_timeout_secs: u64,
    /// Announcer heartbeat cadence, seconds.
    pub heartbeat_interval_secs: u64,
    /// Default invite lifetime, seconds.
    pub invite_ttl_secs: u64,
    /// Replay signing key.
    pub replay_hmac_key: Option<String>,
    /// Invite signing secret.
    pub invite_secret: String,
    /// Secret for master registration tokens.
    pub master_token_secret: Option<String>,
    /// Game server listen address.
    pub bind_addr: SocketAddr,
    /// Master listen address.
    pub master_bind_addr: SocketAddr,
    /// Master to announce to.
    pub master_url: Option<String>,
    /// Host advertised in invites and registrations.
    pub public_host: String,
    /// Name advertised to the master.
    pub server_name: String,
    /// Region advertised to the master.
    pub region: String,
    /// Seat capacity advertised to the master.
    pub max_players: u32,
    /// Ban list file.
    pub banlist_path: PathBuf,
    /// Conflict audit log.
    pub conflict_log_path: PathBuf,
    /// Save backup root; `<save dir>/backups` when unset.
    pub backup_dir: Option<PathBuf>,
    /// Where finished match replays are written; unset disables recording.
    pub replay_dir: Option<PathBuf>,
}

fn random_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            save_conflict_policy: ConflictPolicy::Ask,
            reconnect_backoff: vec![1, 2, 5, 10],
            actions_per_sec: 10,
            bytes_per_min: 65_536,
            pings_per_sec: 5,
            master_requests_per_min: 30,
            rate_limit_strikes: 20,
            ban_seconds: 300,
            outbox_capacity: 64,
            ping_interval_secs: 5,
            idle_timeout_secs: 60,
            lobby_linger_secs: 30,
            registry_timeout_secs: 45,
            heartbeat_interval_secs: 15,
            invite_ttl_secs: 600,
            replay_hmac_key: None,
            invite_secret: random_secret(),
            master_token_secret: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8765)),
            master_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            master_url: None,
            public_host: "127.0.0.1".to_string(),
            server_name: "oko".to_string(),
            region: String::new(),
            max_players: 32,
            banlist_path: PathBuf::from("data/banlist.json"),
            conflict_log_path: PathBuf::from("data/conflict.log"),
            backup_dir: None,
            replay_dir: None,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

impl Settings {
    /// Defaults overridden by `map`.
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut s = Self::default();
        for (key, value) in map {
            let k = key.as_str();
            match k {
                "save_conflict_policy" => s.save_conflict_policy = parse(k, value)?,
                "reconnect_backoff" => {
                    s.reconnect_backoff = value
                        .split(',')
                        .filter(|part| !part.trim().is_empty())
                        .map(|part| parse(k, part))
                        .collect::<Result<_, _>>()?;
                    if s.reconnect_backoff.is_empty() {
                        return Err(ConfigError::Invalid {
                            key: key.clone(),
                            value: value.clone(),
                        });
                    }
                }
                "actions_per_sec" => s.actions_per_sec = parse(k, value)?,
                "bytes_per_min" => s.bytes_per_min = parse(k, value)?,
                "pings_per_sec" => s.pings_per_sec = parse(k, value)?,
                "master_requests_per_min" => s.master_requests_per_min = parse(k, value)?,
                "rate_limit_strikes" => s.rate_limit_strikes = parse(k, value)?,
                "ban_seconds" => s.ban_seconds = parse(k, value)?,
                "outbox_capacity" => s.outbox_capacity = parse(k, value)?,
                "ping_interval_secs" => s.ping_interval_secs = parse(k, value)?,
                "idle_timeout_secs" => s.idle_timeout_secs = parse(k, value)?,
                "lobby_linger_secs" => s.lobby_linger_secs = parse(k, value)?,
                "registry_timeout_secs" => s.registry_timeout_secs = parse(k, value)?,
                "heartbeat_interval_secs" => s.heartbeat_interval_secs = parse(k, value)?,
                "invite_ttl_secs" => s.invite_ttl_secs = parse(k, value)?,
                "replay_hmac_key" => s.replay_hmac_key = optional(value),
                "invite_secret" => {
                    s.invite_secret = optional(value).ok_or_else(|| ConfigError::Invalid {
                        key: key.clone(),
                        value: value.clone(),
                    })?
                }
                "master_token_secret" => s.master_token_secret = optional(value),
                "bind_addr" => s.bind_addr = parse(k, value)?,
                "master_bind_addr" => s.master_bind_addr = parse(k, value)?,
                "master_url" => s.master_url = optional(value),
                "public_host" => s.public_host = value.trim().to_string(),
                "server_name" => s.server_name = value.trim().to_string(),
                "region" => s.region = value.trim().to_string(),
                "max_players" => s.max_players = parse(k, value)?,
                "banlist_path" => s.banlist_path = PathBuf::from(value),
                "conflict_log_path" => s.conflict_log_path = PathBuf::from(value),
                "backup_dir" => s.backup_dir = optional(value).map(PathBuf::from),
                "replay_dir" => s.replay_dir = optional(value).map(PathBuf::from),
                other => debug!(key = other, "ignoring unknown setting"),
            }
        }
        Ok(s)
    }

    /// Defaults overridden by `OKO_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let map = std::env::vars()
            .filter_map(|(k, v)| k.strip_prefix(ENV_PREFIX).map(|rest| (rest.to_ascii_lowercase(), v)))
            .collect();
        Self::from_map(&map)
    }

    /// Session rate limits.
    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            actions_per_sec: self.actions_per_sec,
            bytes_per_min: self.bytes_per_min,
            pings_per_sec: self.pings_per_sec,
            max_strikes: self.rate_limit_strikes,
        }
    }

    /// Reconnect schedule.
    pub fn backoff(&self) -> Backoff {
        Backoff::from_secs(&self.reconnect_backoff)
    }

    /// Master registration token checks.
    pub fn master_auth(&self) -> AuthConfig {
        AuthConfig {
            secret: self.master_token_secret.clone(),
            issuer: None,
        }
    }

    /// Server ping cadence.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    /// Connection idle limit.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    /// Announcer cadence.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

// =============================================================================
// TESTS
// =============================================================================
