//! Message Envelope Codec
//!
//! Both wire protocols (game and master) use the same JSON envelope:
//! `{"t": <type>, "v": <version>, ...fields}`. This module owns the checks
//! that apply to every message before the typed decode runs: a hard size
//! ceiling, object shape, a known `t`, and a matching `v` when present.
//! Anything that fails is a typed [`ProtocolError`]; nothing is partially
//! processed.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Largest accepted message, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 65_536;

/// Envelope or payload failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Message exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message too large ({size} > {max} bytes)")]
    TooLarge {
        /// Actual size.
        size: usize,
        /// Ceiling.
        max: usize,
    },

    /// Not JSON.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// JSON, but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,

    /// No string `t` field.
    #[error("missing 't' field")]
    MissingType,

    /// `t` outside the protocol's set.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// `v` present but different.
    #[error("incompatible protocol version {found} (expected {expected})")]
    VersionMismatch {
        /// Version this side speaks.
        expected: u32,
        /// Version in the message.
        found: String,
    },

    /// Known type, but fields do not fit it.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Message type.
        kind: String,
        /// Decoder error.
        reason: String,
    },
}

/// A closed message union carried in the shared envelope.
///
/// Implementors are serde enums tagged with `#[serde(tag = "t")]`.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Protocol version stamped into `v`.
    const VERSION: u32;
    /// Every `t` value the protocol defines.
    const TYPES: &'static [&'static str];
}

/// Check size and envelope, returning the object with `v` stripped.
pub fn check_envelope<M: WireMessage>(text: &str) -> Result<Value, ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let obj = value.as_object_mut().ok_or(ProtocolError::NotAnObject)?;

    let kind = obj
        .get("t")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;
    if !M::TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    if let Some(v) = obj.remove("v") {
        if v.as_u64() != Some(M::VERSION as u64) {
            return Err(ProtocolError::VersionMismatch {
                expected: M::VERSION,
                found: v.to_string(),
            });
        }
    }
    Ok(value)
}

/// Decode and validate one message.
pub fn decode<M: WireMessage>(text: &str) -> Result<M, ProtocolError> {
    let value = check_envelope::<M>(text)?;
    let kind = value
        .get("t")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

/// Encode one message, stamping the protocol version.
pub fn encode<M: WireMessage>(msg: &M) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let obj = value.as_object_mut().ok_or(ProtocolError::NotAnObject)?;
    obj.insert("v".to_string(), Value::from(M::VERSION));

    let text = value.to_string();
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "t", rename_all = "SCREAMING_SNAKE_CASE")]
    enum Toy {
        Ping { n: u32 },
        Quit,
    }

    impl WireMessage for Toy {
        const VERSION: u32 = 7;
        const TYPES: &'static [&'static str] = &["PING", "QUIT", "RESERVED"];
    }

    #[test]
    fn test_encode_stamps_version() {
        let text = encode(&Toy::Ping { n: 1 }).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["t"], "PING");
        assert_eq!(value["v"], 7);
        assert_eq!(decode::<Toy>(&text).unwrap(), Toy::Ping { n: 1 });
    }

    #[test]
    fn test_version_is_optional_but_checked() {
        assert_eq!(decode::<Toy>(r#"{"t":"QUIT"}"#).unwrap(), Toy::Quit);
        assert!(matches!(
            decode::<Toy>(r#"{"t":"QUIT","v":2}"#),
            Err(ProtocolError::VersionMismatch { expected: 7, .. })
        ));
    }

    #[test]
    fn test_envelope_failures() {
        assert!(matches!(decode::<Toy>("not json"), Err(ProtocolError::Malformed(_))));
        assert_eq!(decode::<Toy>("[1,2]").unwrap_err(), ProtocolError::NotAnObject);
        assert_eq!(decode::<Toy>(r#"{"n":1}"#).unwrap_err(), ProtocolError::MissingType);
        assert_eq!(
            decode::<Toy>(r#"{"t":"HACK"}"#).unwrap_err(),
            ProtocolError::UnknownType("HACK".into())
        );
        assert!(matches!(
            decode::<Toy>(r#"{"t":"PING","n":"x"}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
        // known to the envelope, but no variant carries it
        assert!(matches!(
            decode::<Toy>(r#"{"t":"RESERVED"}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_size_ceiling() {
        let big = format!(r#"{{"t":"QUIT","pad":"{}"}}"#, "x".repeat(MAX_MESSAGE_SIZE));
        assert!(matches!(decode::<Toy>(&big), Err(ProtocolError::TooLarge { .. })));
    }
}
