//! Abuse Controls
//!
//! Rate limiting built on `governor`: a per-session [`SessionGuard`] for
//! game connections (actions, pings and a weighted byte budget), a keyed
//! per-IP [`IpLimiter`] for the master directory and for invite creation,
//! and a persisted [`BanList`]. Rejected traffic is dropped; only repeated
//! violations escalate to a ban.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    DefaultKeyedRateLimiter, Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::clock::SharedClock;
use crate::master::registry::LobbyInfo;

/// Direct (un-keyed) limiter.
pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Longest accepted server name in a master registration.
pub const MAX_NAME_LEN: usize = 64;

/// Longest accepted mode or region label.
pub const MAX_LABEL_LEN: usize = 32;

/// Invite creations allowed per IP per minute.
pub const INVITES_PER_MIN: u32 = 5;

/// Security check failure.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// A rate limit was hit.
    #[error("rate limit exceeded: {0}")]
    RateLimited(&'static str),

    /// Peer is banned.
    #[error("{0} is banned")]
    Banned(IpAddr),

    /// Registration payload failed a sanity check.
    #[error("invalid {field}: {reason}")]
    InvalidPayload {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Ban list could not be read or written.
    #[error("ban list I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Ban list is not valid JSON.
    #[error("ban list format: {0}")]
    Format(#[from] serde_json::Error),
}

fn nonzero(n: u32) -> NonZeroU32 {
    NonZeroU32::new(n).unwrap_or(NonZeroU32::MIN)
}

/// Limiter allowing `n` events per second.
pub fn per_second(n: u32) -> Limiter {
    RateLimiter::direct(Quota::per_second(nonzero(n)))
}

/// Limiter allowing `n` units per minute.
pub fn per_minute(n: u32) -> Limiter {
    RateLimiter::direct(Quota::per_minute(nonzero(n)))
}

// =============================================================================
// SESSION GUARD
// =============================================================================

/// Per-session thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimits {
    /// `ACTION` messages per second.
    pub actions_per_sec: u32,
    /// Inbound bytes per minute, all message kinds.
    pub bytes_per_min: u32,
    /// `PING` messages per second.
    pub pings_per_sec: u32,
    /// Violations before escalation; `0` never escalates.
    pub max_strikes: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            actions_per_sec: 10,
            bytes_per_min: 65_536,
            pings_per_sec: 5,
            max_strikes: 20,
        }
    }
}

/// What kind of inbound message is being admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traffic {
    /// A game action.
    Action,
    /// A ping.
    Ping,
    /// Anything else; only the byte budget applies.
    Other,
}

/// Rate limits for one connection.
pub struct SessionGuard {
    actions: Limiter,
    bytes: Limiter,
    pings: Limiter,
    strikes: u32,
    max_strikes: u32,
}

impl SessionGuard {
    /// Guard with the given thresholds.
    pub fn new(limits: RateLimits) -> Self {
        Self {
            actions: per_second(limits.actions_per_sec),
            bytes: per_minute(limits.bytes_per_min),
            pings: per_second(limits.pings_per_sec),
            strikes: 0,
            max_strikes: limits.max_strikes,
        }
    }

    /// Charge one message of `size` bytes.
    pub fn admit(&mut self, kind: Traffic, size: usize) -> Result<(), SecurityError> {
        let result = self.check(kind, size);
        if result.is_err() {
            self.strikes += 1;
        }
        result
    }

    fn check(&self, kind: Traffic, size: usize) -> Result<(), SecurityError> {
        if let Some(n) = NonZeroU32::new(u32::try_from(size).unwrap_or(u32::MAX)) {
            if !matches!(self.bytes.check_n(n), Ok(Ok(()))) {
                return Err(SecurityError::RateLimited("bytes per minute"));
            }
        }
        match kind {
            Traffic::Action if self.actions.check().is_err() => Err(SecurityError::RateLimited("actions per second")),
            Traffic::Ping if self.pings.check().is_err() => Err(SecurityError::RateLimited("pings per second")),
            _ => Ok(()),
        }
    }

    /// Violations so far.
    pub fn strikes(&self) -> u32 {
        self.strikes
    }

    /// Whether violations have reached the escalation threshold.
    pub fn should_escalate(&self) -> bool {
        self.max_strikes > 0 && self.strikes >= self.max_strikes
    }
}

// =============================================================================
// PER-IP LIMITS
// =============================================================================

/// Requests per minute, counted per peer address.
pub struct IpLimiter {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
}

impl IpLimiter {
    /// Limiter allowing `per_min` requests per address per minute.
    pub fn per_minute(per_min: u32) -> Self {
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(nonzero(per_min))),
        }
    }

    /// Charge one request for `ip`. `false` when over the limit.
    pub fn check(&self, ip: IpAddr) -> bool {
        let ok = self.limiter.check_key(&ip).is_ok();
        if !ok {
            debug!(%ip, "per-ip rate limit hit");
        }
        ok
    }

    /// Forget addresses whose quota has fully replenished.
    pub fn retain_recent(&self) {
        self.limiter.retain_recent();
    }
}

/// Invite creations per peer address.
pub struct InviteLimiter(IpLimiter);

impl InviteLimiter {
    /// [`INVITES_PER_MIN`] per address.
    pub fn new() -> Self {
        Self(IpLimiter::per_minute(INVITES_PER_MIN))
    }

    /// Charge one creation for `ip`.
    pub fn allow(&self, ip: IpAddr) -> bool {
        self.0.check(ip)
    }
}

impl Default for InviteLimiter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// BAN LIST
// =============================================================================

/// One ban.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanEntry {
    /// Unix seconds when the ban lapses; `None` is permanent.
    #[serde(default)]
    pub until: Option<f64>,
    /// Free-form reason.
    #[serde(default)]
    pub reason: String,
}

/// Banned addresses, optionally persisted as a JSON object keyed by IP.
pub struct BanList {
    path: Option<PathBuf>,
    entries: BTreeMap<IpAddr, BanEntry>,
    clock: SharedClock,
}

impl BanList {
    /// Empty, unpersisted list.
    pub fn in_memory(clock: SharedClock) -> Self {
        Self {
            path: None,
            entries: BTreeMap::new(),
            clock,
        }
    }

    /// Load from `path`; a missing file is an empty list.
    pub fn load(path: impl Into<PathBuf>, clock: SharedClock) -> Result<Self, SecurityError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        let mut list = Self {
            path: Some(path),
            entries,
            clock,
        };
        list.purge_expired();
        Ok(list)
    }

    /// Ban `ip` for `secs` seconds, or permanently for `None`.
    pub fn ban(&mut self, ip: IpAddr, secs: Option<f64>, reason: &str) -> Result<(), SecurityError> {
        let until = secs.map(|s| self.clock.now() + s);
        self.entries.insert(
            ip,
            BanEntry {
                until,
                reason: reason.to_string(),
            },
        );
        warn!(%ip, ?until, reason, "address banned");
        self.persist()
    }

    /// Lift a ban. Returns whether one existed.
    pub fn unban(&mut self, ip: IpAddr) -> Result<bool, SecurityError> {
        let existed = self.entries.remove(&ip).is_some();
        if existed {
            info!(%ip, "ban lifted");
            self.persist()?;
        }
        Ok(existed)
    }

    /// Whether `ip` is currently banned.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        let now = self.clock.now();
        self.entries
            .get(&ip)
            .is_some_and(|e| e.until.map_or(true, |until| now < until))
    }

    /// Drop lapsed bans from memory. Returns how many went.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.until.map_or(true, |until| now < until));
        before - self.entries.len()
    }

    /// Number of entries, lapsed or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<(), SecurityError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string_pretty(&self.entries)?.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

// =============================================================================
// PAYLOAD CHECKS
// =============================================================================

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), SecurityError> {
    if value.chars().count() > max {
        return Err(SecurityError::InvalidPayload {
            field,
            reason: format!("longer than {max} characters"),
        });
    }
    Ok(())
}

/// Sanity checks on a master registration or heartbeat payload.
pub fn validate_master_payload(info: &LobbyInfo) -> Result<(), SecurityError> {
    if info.host.trim().is_empty() {
        return Err(SecurityError::InvalidPayload {
            field: "host",
            reason: "empty".into(),
        });
    }
    if info.port == 0 {
        return Err(SecurityError::InvalidPayload {
            field: "port",
            reason: "must be non-zero".into(),
        });
    }
    check_len("name", &info.name, MAX_NAME_LEN)?;
    check_len("mode", &info.mode, MAX_LABEL_LEN)?;
    check_len("region", &info.region, MAX_LABEL_LEN)?;
    if info.cur_players > info.max_players {
        return Err(SecurityError::InvalidPayload {
            field: "cur_players",
            reason: format!("{} exceeds max_players {}", info.cur_players, info.max_players),
        });
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn test_session_guard_actions() {
        let mut guard = SessionGuard::new(RateLimits {
            actions_per_sec: 3,
            max_strikes: 2,
            ..RateLimits::default()
        });
        for _ in 0..3 {
            assert!(guard.admit(Traffic::Action, 10).is_ok());
        }
        assert!(matches!(guard.admit(Traffic::Action, 10), Err(SecurityError::RateLimited(_))));
        assert!(!guard.should_escalate());
        assert!(guard.admit(Traffic::Other, 10).is_ok());
        assert!(guard.admit(Traffic::Action, 10).is_err());
        assert!(guard.should_escalate());
    }

    #[test]
    fn test_session_guard_bytes() {
        let mut guard = SessionGuard::new(RateLimits {
            bytes_per_min: 100,
            ..RateLimits::default()
        });
        assert!(guard.admit(Traffic::Other, 60).is_ok());
        assert!(guard.admit(Traffic::Other, 60).is_err());
        assert!(guard.admit(Traffic::Other, 500).is_err());
        assert!(guard.admit(Traffic::Other, 0).is_ok());
        assert_eq!(guard.strikes(), 2);
    }

    #[test]
    fn test_zero_strikes_never_escalates() {
        let mut guard = SessionGuard::new(RateLimits {
            pings_per_sec: 1,
            max_strikes: 0,
            ..RateLimits::default()
        });
        for _ in 0..10 {
            let _ = guard.admit(Traffic::Ping, 1);
        }
        assert!(!guard.should_escalate());
    }

    #[test]
    fn test_ip_limiter_is_per_key() {
        let limiter = IpLimiter::per_minute(2);
        assert!(limiter.check(ip(1)));
        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
        assert!(limiter.check(ip(2)));

        let invites = InviteLimiter::new();
        for _ in 0..INVITES_PER_MIN {
            assert!(invites.allow(ip(3)));
        }
        assert!(!invites.allow(ip(3)));
    }

    #[test]
    fn test_ban_list_expiry_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bans").join("banlist.json");
        let clock = ManualClock::new(1_000.0);

        let mut bans = BanList::load(&path, clock.clone()).unwrap();
        assert!(bans.is_empty());
        bans.ban(ip(1), Some(60.0), "flood").unwrap();
        bans.ban(ip(2), None, "cheat").unwrap();
        assert!(bans.is_banned(ip(1)));
        assert!(!bans.is_banned(ip(3)));

        let reloaded = BanList::load(&path, clock.clone()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.is_banned(ip(2)));

        clock.advance(61.0);
        assert!(!reloaded.is_banned(ip(1)));
        assert!(reloaded.is_banned(ip(2)));
        let mut reloaded = BanList::load(&path, clock).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.unban(ip(2)).unwrap());
        assert!(!reloaded.unban(ip(2)).unwrap());
    }

    #[test]
    fn test_master_payload_checks() {
        let mut info = LobbyInfo {
            host: "1.2.3.4".into(),
            port: 8765,
            name: "srv".into(),
            mode: "coop".into(),
            max_players: 4,
            cur_players: 1,
            region: "eu".into(),
            build: "1.0".into(),
            protocol: 1,
        };
        assert!(validate_master_payload(&info).is_ok());

        info.name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            validate_master_payload(&info),
            Err(SecurityError::InvalidPayload { field: "name", .. })
        ));
        info.name = "srv".into();
        info.region = "r".repeat(MAX_LABEL_LEN + 1);
        assert!(validate_master_payload(&info).is_err());
        info.region = "eu".into();
        info.cur_players = 5;
        assert!(validate_master_payload(&info).is_err());
        info.cur_players = 1;
        info.port = 0;
        assert!(validate_master_payload(&info).is_err());
    }
}
