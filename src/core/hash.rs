//! Hashing and Signing
//!
//! SHA-256 digests for save-file integrity and state comparison, and
//! HMAC-SHA256 for replay trailers and invite tokens.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Compute a SHA-256 hash of arbitrary data.
pub fn hash_bytes(data: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute a hash with a domain separator prefix.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of `data`, the form stored in save metadata.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(hash_bytes(data))
}

/// Incremental HMAC-SHA256, for signing data that arrives in pieces.
pub struct Signer {
    mac: HmacSha256,
}

impl Signer {
    /// Start a MAC under `key`.
    pub fn new(key: &[u8]) -> Self {
        // HMAC pads or hashes the key, so every length is accepted
        let mac = <HmacSha256 as Mac>::new_from_slice(key)
            .unwrap_or_else(|_| <HmacSha256 as Mac>::new(&Default::default()));
        Self { mac }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    /// Finish and hex-encode the tag.
    pub fn finalize_hex(self) -> String {
        hex::encode(self.mac.finalize().into_bytes())
    }

    /// Finish and compare against a hex tag in constant time.
    pub fn verify_hex(self, signature_hex: &str) -> bool {
        match hex::decode(signature_hex) {
            Ok(expected) => self.mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }
}

/// HMAC-SHA256 of `data` under `key`, hex encoded.
pub fn hmac_sign_hex(key: &[u8], data: &[u8]) -> String {
    let mut signer = Signer::new(key);
    signer.update(data);
    signer.finalize_hex()
}

/// Constant-time check of a hex HMAC produced by [`hmac_sign_hex`].
pub fn hmac_verify_hex(key: &[u8], data: &[u8], signature_hex: &str) -> bool {
    let mut signer = Signer::new(key);
    signer.update(data);
    signer.verify_hex(signature_hex)
}

// =============================================================================
// TESTS
// =============================================================================
