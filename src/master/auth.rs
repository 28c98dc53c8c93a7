//! Registration Tokens
//!
//! When the master is configured with a shared secret, `REGISTER` must carry
//! an HS256 JWT signed with it. Without a secret registration is open.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Verification settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// HS256 secret. `None` disables verification.
    pub secret: Option<String>,
    /// Expected issuer claim. If None, any issuer accepted.
    pub issuer: Option<String>,
}

impl AuthConfig {
    /// Config requiring tokens signed with `secret`.
    pub fn with_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
            issuer: None,
        }
    }

    /// Whether tokens are required.
    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }
}

/// Claims carried by a registration token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Server identity.
    pub sub: String,
    /// Expiry timestamp (Unix seconds).
    pub exp: u64,
    /// Issued at timestamp.
    #[serde(default)]
    pub iat: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Token rejection.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Verification is on and no token was sent.
    #[error("registration token required")]
    Missing,
    /// Token format is invalid.
    #[error("invalid token format")]
    InvalidFormat,
    /// Token signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,
    /// Token has expired.
    #[error("token expired")]
    Expired,
    /// Issuer claim doesn't match expected value.
    #[error("invalid issuer")]
    InvalidIssuer,
    /// Subject claim is empty.
    #[error("missing required claim: sub")]
    MissingSubject,
    /// Any other JWT failure.
    #[error("token error: {0}")]
    Jwt(String),
}

/// Check a `REGISTER` token. Returns the claims, or `None` when
/// verification is switched off.
pub fn verify_registration(token: Option<&str>, config: &AuthConfig) -> Result<Option<TokenClaims>, AuthError> {
    let Some(secret) = &config.secret else {
        return Ok(None);
    };
    let token = token.ok_or(AuthError::Missing)?;

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp", "sub"]);
    validation.validate_aud = false;
    if let Some(ref issuer) = config.issuer {
        validation.set_issuer(&[issuer]);
    }

    let key = DecodingKey::from_secret(secret.as_bytes());
    let data: TokenData<TokenClaims> = decode(token, &key, &validation).map_err(map_jwt_error)?;
    if data.claims.sub.is_empty() {
        return Err(AuthError::MissingSubject);
    }
    Ok(Some(data.claims))
}

/// Mint a registration token for `sub`, valid from `now` for `ttl` seconds.
pub fn issue_token(sub: &str, secret: &str, now: u64, ttl: u64) -> Result<String, AuthError> {
    let claims = TokenClaims {
        sub: sub.to_string(),
        exp: now + ttl,
        iat: now,
        iss: None,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(map_jwt_error)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::InvalidSignature,
        ErrorKind::InvalidIssuer => AuthError::InvalidIssuer,
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => AuthError::InvalidFormat,
        _ => AuthError::Jwt(err.to_string()),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "master-secret";

    fn now() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    #[test]
    fn test_open_registration() {
        assert!(verify_registration(None, &AuthConfig::default()).unwrap().is_none());
        assert!(verify_registration(Some("garbage"), &AuthConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_valid_token() {
        let token = issue_token("eu-1", SECRET, now(), 3600).unwrap();
        let claims = verify_registration(Some(&token), &AuthConfig::with_secret(SECRET))
            .unwrap()
            .unwrap();
        assert_eq!(claims.sub, "eu-1");
    }

    #[test]
    fn test_rejections() {
        let config = AuthConfig::with_secret(SECRET);
        assert!(matches!(verify_registration(None, &config), Err(AuthError::Missing)));

        let wrong = issue_token("eu-1", "other", now(), 3600).unwrap();
        assert!(matches!(
            verify_registration(Some(&wrong), &config),
            Err(AuthError::InvalidSignature)
        ));

        let stale = issue_token("eu-1", SECRET, now() - 7200, 60).unwrap();
        assert!(matches!(verify_registration(Some(&stale), &config), Err(AuthError::Expired)));

        assert!(matches!(
            verify_registration(Some("not.a.jwt"), &config),
            Err(AuthError::InvalidFormat) | Err(AuthError::Jwt(_))
        ));
    }
}
