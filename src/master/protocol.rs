//! Master Protocol Messages
//!
//! Game servers talk to the master directory over the same `{t, v, ...}`
//! envelope as the game protocol, with a disjoint set of message types.

use serde::{Deserialize, Serialize};

use crate::master::registry::{ListFilter, LobbyInfo, ServerEntry};
use crate::network::codec::WireMessage;

/// Master protocol version.
pub const MASTER_PROTOCOL_VERSION: u32 = 1;

/// Every master message type.
pub const MASTER_TYPES: &[&str] = &["REGISTER", "HEARTBEAT", "UNREGISTER", "LIST", "PING", "ERROR"];

// =============================================================================
// REQUESTS
// =============================================================================

/// Messages sent to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasterRequest {
    /// Announce a server.
    Register {
        /// Advertised details.
        #[serde(flatten)]
        info: LobbyInfo,
        /// Registration JWT, when the master requires one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Keep a registration alive.
    Heartbeat {
        /// Id from `REGISTER`.
        server_id: String,
        /// Players connected now.
        #[serde(default)]
        cur_players: u32,
    },

    /// Withdraw a registration.
    Unregister {
        /// Id from `REGISTER`.
        server_id: String,
    },

    /// Query live servers.
    List {
        /// Exact-match filters.
        #[serde(flatten)]
        filter: ListFilter,
        /// Maximum entries returned.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// Liveness probe.
    Ping,
}

// =============================================================================
// REPLIES
// =============================================================================

/// Messages sent by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MasterReply {
    /// Registration accepted.
    Register {
        /// Issued id.
        server_id: String,
    },

    /// Heartbeat accepted.
    Heartbeat,

    /// Registration withdrawn.
    Unregister,

    /// Query result.
    List {
        /// Matching servers.
        servers: Vec<ServerEntry>,
    },

    /// Liveness answer.
    Ping,

    /// Request refused.
    Error {
        /// Why.
        message: String,
    },
}

impl MasterReply {
    /// Error reply.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl WireMessage for MasterRequest {
    const VERSION: u32 = MASTER_PROTOCOL_VERSION;
    const TYPES: &'static [&'static str] = MASTER_TYPES;
}

impl WireMessage for MasterReply {
    const VERSION: u32 = MASTER_PROTOCOL_VERSION;
    const TYPES: &'static [&'static str] = MASTER_TYPES;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::{decode, encode, ProtocolError};

    #[test]
    fn test_register_wire_shape() {
        let text = r#"{"t":"REGISTER","v":1,"host":"1.2.3.4","port":8765,"name":"srv","max_players":4}"#;
        match decode::<MasterRequest>(text).unwrap() {
            MasterRequest::Register { info, token } => {
                assert_eq!(info.host, "1.2.3.4");
                assert_eq!(info.port, 8765);
                assert_eq!(info.cur_players, 0);
                assert_eq!(token, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_list_filter_fields() {
        let req = decode::<MasterRequest>(r#"{"t":"LIST","mode":"coop","limit":5}"#).unwrap();
        assert_eq!(
            req,
            MasterRequest::List {
                filter: ListFilter {
                    mode: Some("coop".into()),
                    ..ListFilter::default()
                },
                limit: Some(5),
            }
        );
    }

    #[test]
    fn test_game_types_rejected() {
        assert_eq!(
            decode::<MasterRequest>(r#"{"t":"ACTION","seq":1}"#),
            Err(ProtocolError::UnknownType("ACTION".into()))
        );
        assert!(matches!(
            decode::<MasterRequest>(r#"{"t":"HEARTBEAT","v":2,"server_id":"x"}"#),
            Err(ProtocolError::VersionMismatch { expected: 1, .. })
        ));
    }

    #[test]
    fn test_reply_stamps_version() {
        let text = encode(&MasterReply::error("unknown server_id")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["t"], "ERROR");
        assert_eq!(value["v"], 1);
        assert_eq!(value["message"], "unknown server_id");
        assert_eq!(decode::<MasterReply>(&text).unwrap(), MasterReply::error("unknown server_id"));
    }
}
