//! Invites
//!
//! An invite names a lobby (`host`, `port`, `room`), an expiry and a random
//! join code, signed with HMAC-SHA256 under a server-held secret. The
//! [`InviteBook`] tracks one current signature per code: refreshing issues a
//! new expiry and signature for the same code and retires the old one, and
//! revoking a code is permanent.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::core::clock::SharedClock;
use crate::core::hash::{hmac_sign_hex, hmac_verify_hex};

/// Characters used in join codes (no I, L or O).
pub const INVITE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ234567890";

/// URL scheme of invite links.
pub const INVITE_SCHEME: &str = "oko";

/// Invite failure. Nothing is mutated when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InviteError {
    /// Code was revoked.
    #[error("invite {0} has been revoked")]
    Revoked(String),

    /// Signature is not the current one for the code.
    #[error("invite {0} has been superseded by a refresh")]
    Superseded(String),

    /// Signature does not match the payload.
    #[error("invite signature is invalid")]
    BadSignature,

    /// Past its expiry.
    #[error("invite expired at {0}")]
    Expired(u64),

    /// Code is not tracked by this server.
    #[error("unknown invite code {0}")]
    UnknownCode(String),

    /// Link could not be parsed.
    #[error("invalid invite url: {0}")]
    BadUrl(String),
}

/// A signed invite.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invite {
    /// Game server host.
    pub host: String,
    /// Game server port.
    pub port: u16,
    /// Lobby id.
    pub room: String,
    /// Expiry, unix seconds.
    pub exp: u64,
    /// Join code, `XXXX-YYYY`.
    pub code: String,
    /// Hex HMAC over the other fields.
    pub sig: String,
}

impl Invite {
    fn signing_input(host: &str, port: u16, room: &str, exp: u64, code: &str) -> Vec<u8> {
        format!("{host}|{port}|{room}|{exp}|{code}").into_bytes()
    }

    fn sign(&mut self, secret: &[u8]) {
        let input = Self::signing_input(&self.host, self.port, &self.room, self.exp, &self.code);
        self.sig = hmac_sign_hex(secret, &input);
    }

    /// Check signature, then expiry against `now`.
    pub fn verify(&self, secret: &[u8], now: f64) -> Result<(), InviteError> {
        let input = Self::signing_input(&self.host, self.port, &self.room, self.exp, &self.code);
        if !hmac_verify_hex(secret, &input, &self.sig) {
            return Err(InviteError::BadSignature);
        }
        if now > self.exp as f64 {
            return Err(InviteError::Expired(self.exp));
        }
        Ok(())
    }

    /// `oko://join?host=..&port=..&room=..&exp=..&code=..&sig=..`
    pub fn to_url(&self) -> String {
        let mut url = match Url::parse(&format!("{INVITE_SCHEME}://join")) {
            Ok(url) => url,
            Err(_) => return String::new(),
        };
        url.query_pairs_mut()
            .append_pair("host", &self.host)
            .append_pair("port", &self.port.to_string())
            .append_pair("room", &self.room)
            .append_pair("exp", &self.exp.to_string())
            .append_pair("code", &self.code)
            .append_pair("sig", &self.sig);
        url.to_string()
    }

    /// Parse a link produced by [`Invite::to_url`].
    pub fn from_url(text: &str) -> Result<Self, InviteError> {
        let url = Url::parse(text).map_err(|e| InviteError::BadUrl(e.to_string()))?;
        if url.scheme() != INVITE_SCHEME {
            return Err(InviteError::BadUrl(format!("unexpected scheme {}", url.scheme())));
        }
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let field = |key: &str| {
            params
                .get(key)
                .cloned()
                .ok_or_else(|| InviteError::BadUrl(format!("missing {key}")))
        };
        let number = |key: &str| -> Result<u64, InviteError> {
            field(key)?
                .parse()
                .map_err(|_| InviteError::BadUrl(format!("{key} is not a number")))
        };
        let port = u16::try_from(number("port")?).map_err(|_| InviteError::BadUrl("port out of range".into()))?;

        Ok(Self {
            host: field("host")?,
            port,
            room: field("room")?,
            exp: number("exp")?,
            code: field("code")?,
            sig: field("sig")?,
        })
    }
}

/// Random `XXXX-YYYY` join code.
pub fn generate_code<R: Rng>(rng: &mut R) -> String {
    let raw: Vec<char> = (0..8)
        .map(|_| INVITE_ALPHABET[rng.gen_range(0..INVITE_ALPHABET.len())] as char)
        .collect();
    let (a, b) = raw.split_at(4);
    format!("{}-{}", a.iter().collect::<String>(), b.iter().collect::<String>())
}

/// Server-side invite registry.
pub struct InviteBook {
    clock: SharedClock,
    invites: HashMap<String, Invite>,
    revoked: HashSet<String>,
}

impl InviteBook {
    /// Empty book.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            invites: HashMap::new(),
            revoked: HashSet::new(),
        }
    }

    /// Issue a new invite valid for `ttl` seconds.
    pub fn create(&mut self, host: &str, port: u16, room: &str, secret: &[u8], ttl: u64) -> Invite {
        let mut rng = rand::thread_rng();
        let mut code = generate_code(&mut rng);
        while self.invites.contains_key(&code) || self.revoked.contains(&code) {
            code = generate_code(&mut rng);
        }

        let mut invite = Invite {
            host: host.to_string(),
            port,
            room: room.to_string(),
            exp: self.clock.now() as u64 + ttl,
            code,
            sig: String::new(),
        };
        invite.sign(secret);
        self.invites.insert(invite.code.clone(), invite.clone());
        info!(code = %invite.code, room, ttl, "invite created");
        invite
    }

    /// Accept or reject a presented invite.
    ///
    /// Revoked codes always fail. For tracked codes the signature must be
    /// the current one; anything else falls through to the plain
    /// signature and expiry check.
    pub fn validate(&self, invite: &Invite, secret: &[u8]) -> Result<(), InviteError> {
        if self.revoked.contains(&invite.code) {
            return Err(InviteError::Revoked(invite.code.clone()));
        }
        if let Some(current) = self.invites.get(&invite.code) {
            if current.sig != invite.sig {
                return Err(InviteError::Superseded(invite.code.clone()));
            }
        }
        invite.verify(secret, self.clock.now())
    }

    /// New expiry and signature for the same code; the previous signature
    /// stops validating.
    pub fn refresh(&mut self, code: &str, secret: &[u8], ttl: u64) -> Result<Invite, InviteError> {
        if self.revoked.contains(code) {
            return Err(InviteError::Revoked(code.to_string()));
        }
        let now = self.clock.now() as u64;
        let invite = self
            .invites
            .get_mut(code)
            .ok_or_else(|| InviteError::UnknownCode(code.to_string()))?;
        // keep expiry strictly increasing even within the same second
        invite.exp = (now + ttl).max(invite.exp + 1);
        invite.sign(secret);
        debug!(code, exp = invite.exp, "invite refreshed");
        Ok(invite.clone())
    }

    /// Permanently disable `code`.
    pub fn revoke(&mut self, code: &str) {
        self.invites.remove(code);
        self.revoked.insert(code.to_string());
        info!(code, "invite revoked");
    }

    /// Current invite for a code.
    pub fn get(&self, code: &str) -> Option<&Invite> {
        self.invites.get(code)
    }

    /// Drop tracked invites that have expired. Revocations are kept.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.invites.len();
        self.invites.retain(|_, inv| inv.exp as f64 >= now);
        before - self.invites.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use std::sync::Arc;

    const SECRET: &[u8] = b"invite-secret";

    fn book() -> (InviteBook, Arc<ManualClock>) {
        let clock = ManualClock::new(1_000.0);
        (InviteBook::new(clock.clone()), clock)
    }

    #[test]
    fn test_code_format() {
        let code = generate_code(&mut rand::thread_rng());
        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");
        assert!(code
            .bytes()
            .filter(|&b| b != b'-')
            .all(|b| INVITE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_lifecycle() {
        let (mut book, _) = book();
        let original = book.create("10.0.0.1", 8765, "room-1", SECRET, 60);
        assert_eq!(original.exp, 1_060);
        assert_eq!(book.validate(&original, SECRET), Ok(()));
        assert_eq!(book.validate(&original, b"other"), Err(InviteError::BadSignature));

        let refreshed = book.refresh(&original.code, SECRET, 60).unwrap();
        assert_eq!(refreshed.code, original.code);
        assert_ne!(refreshed.sig, original.sig);
        assert!(refreshed.exp > original.exp);
        assert_eq!(book.validate(&refreshed, SECRET), Ok(()));
        assert_eq!(
            book.validate(&original, SECRET),
            Err(InviteError::Superseded(original.code.clone()))
        );

        book.revoke(&original.code);
        assert_eq!(
            book.validate(&refreshed, SECRET),
            Err(InviteError::Revoked(original.code.clone()))
        );
        assert!(book.refresh(&original.code, SECRET, 60).is_err());
    }

    #[test]
    fn test_expiry() {
        let (mut book, clock) = book();
        let invite = book.create("h", 1, "r", SECRET, 10);
        clock.advance(10.0);
        assert_eq!(book.validate(&invite, SECRET), Ok(()));
        clock.advance(1.0);
        assert_eq!(book.validate(&invite, SECRET), Err(InviteError::Expired(1_010)));
        assert_eq!(book.purge_expired(), 1);
    }

    #[test]
    fn test_tampered_payload() {
        let (mut book, _) = book();
        let mut invite = book.create("h", 1, "r", SECRET, 10);
        invite.room = "other".into();
        assert_eq!(book.validate(&invite, SECRET), Err(InviteError::BadSignature));
    }

    #[test]
    fn test_url_round_trip() {
        let (mut book, _) = book();
        let invite = book.create("play.example.org", 8765, "room 7", SECRET, 30);
        let url = invite.to_url();
        assert!(url.starts_with("oko://join?"));
        assert_eq!(Invite::from_url(&url).unwrap(), invite);
        assert!(Invite::from_url("http://join?host=a").is_err());
        assert!(Invite::from_url("oko://join?host=a").is_err());
    }
}
