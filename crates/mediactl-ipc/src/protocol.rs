//! Control-socket protocol types.
//!
//! One request envelope travels per connection; the reply is a bare status
//! code. Request payloads are serde-JSON documents ([`TableUpdate`] for
//! storage mutations, [`GrantRequest`] for command permission bookkeeping)
//! rather than free-form strings, so no field can collide with a framing
//! delimiter.

use serde::{Deserialize, Serialize};

use mediactl_types::{Metadata, PlaybackState, RepeatMode, ServerState, ShuffleMode};

use crate::transport::MAX_PAYLOAD_SIZE;

/// Sentinel payload of a [`MessageType::ServerConnection`] request.
pub const CONNECT_MSG: &str = "Connect";

/// Sentinel payload of a [`MessageType::ServerDisconnection`] request.
pub const DISCONNECT_MSG: &str = "Disconnect";

/// Request kind carried in the envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    DbUpdate,
    ClientSet,
    ClientGet,
    ServerConnection,
    ServerDisconnection,
}

impl MessageType {
    #[must_use]
    pub fn wire_value(self) -> u32 {
        match self {
            MessageType::DbUpdate => 0,
            MessageType::ClientSet => 1,
            MessageType::ClientGet => 2,
            MessageType::ServerConnection => 3,
            MessageType::ServerDisconnection => 4,
        }
    }

    #[must_use]
    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(MessageType::DbUpdate),
            1 => Some(MessageType::ClientSet),
            2 => Some(MessageType::ClientGet),
            3 => Some(MessageType::ServerConnection),
            4 => Some(MessageType::ServerDisconnection),
            _ => None,
        }
    }
}

/// One control-socket request: fixed header fields plus a bounded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub pid: i32,
    pub uid: u32,
    pub result: i32,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build a request stamped with the calling process's pid and uid.
    #[must_use]
    pub fn request(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            pid: i32::try_from(std::process::id()).unwrap_or_default(),
            uid: nix::unistd::getuid().as_raw(),
            result: 0,
            payload,
        }
    }

    /// Payload interpreted as UTF-8, for the connection sentinels.
    #[must_use]
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Which command family a permission grant covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Playback,
    Custom,
}

/// CLIENT_SET / CLIENT_GET body: a client pre-declares a command it is about
/// to send, and the receiving server checks (and consumes) the declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRequest {
    pub peer: String,
    pub kind: CommandKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// DB_UPDATE body: every mutation the daemon may apply to the shared table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TableUpdate {
    RegisterServer { name: String },
    SetServerState { name: String, state: ServerState },
    UpdatePlayback {
        name: String,
        state: PlaybackState,
        position: u64,
    },
    UpdateMetadata { name: String, metadata: Metadata },
    UpdateShuffle { name: String, mode: ShuffleMode },
    UpdateRepeat { name: String, mode: RepeatMode },
    SetLatest { name: String },
    /// Drop the server from the known-server list but keep its row.
    UnlistServer { name: String },
    RemoveServer { name: String },
}

/// Serialize a request body, enforcing the envelope payload bound before
/// anything touches a socket.
fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, PayloadError> {
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(PayloadError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}

impl TableUpdate {
    /// # Errors
    ///
    /// Returns [`PayloadError::TooLarge`] when the encoded form exceeds the
    /// envelope payload bound.
    pub fn to_payload(&self) -> Result<Vec<u8>, PayloadError> {
        encode_payload(self)
    }
}

impl GrantRequest {
    /// # Errors
    ///
    /// Returns [`PayloadError::TooLarge`] when the encoded form exceeds the
    /// envelope payload bound.
    pub fn to_payload(&self) -> Result<Vec<u8>, PayloadError> {
        encode_payload(self)
    }
}

/// Errors building a request payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload too large: {0} bytes (max: {MAX_PAYLOAD_SIZE})")]
    TooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_wire_values() {
        assert_eq!(MessageType::DbUpdate.wire_value(), 0);
        assert_eq!(MessageType::ClientSet.wire_value(), 1);
        assert_eq!(MessageType::ClientGet.wire_value(), 2);
        assert_eq!(MessageType::ServerConnection.wire_value(), 3);
        assert_eq!(MessageType::ServerDisconnection.wire_value(), 4);
    }

    #[test]
    fn test_message_type_from_wire_roundtrip() {
        for value in 0..=4 {
            let msg_type = MessageType::from_wire(value).unwrap();
            assert_eq!(msg_type.wire_value(), value);
        }
        assert!(MessageType::from_wire(5).is_none());
    }

    #[test]
    fn test_envelope_request_stamps_identity() {
        let envelope = Envelope::request(MessageType::ClientSet, b"x".to_vec());
        assert!(envelope.pid > 0);
        assert_eq!(envelope.result, 0);
    }

    #[test]
    fn test_envelope_payload_str() {
        let envelope = Envelope::request(MessageType::ServerConnection, CONNECT_MSG.into());
        assert_eq!(envelope.payload_str(), Some("Connect"));

        let envelope = Envelope::request(MessageType::DbUpdate, vec![0xff, 0xfe]);
        assert!(envelope.payload_str().is_none());
    }

    #[test]
    fn test_grant_request_roundtrip() {
        let grant = GrantRequest {
            peer: "org.example.player".to_string(),
            kind: CommandKind::Custom,
            token: Some("rewind_to_start".to_string()),
        };
        let payload = grant.to_payload().unwrap();
        let back: GrantRequest = serde_json::from_slice(&payload).unwrap();
        assert_eq!(back, grant);
    }

    #[test]
    fn test_grant_request_omits_empty_token() {
        let grant = GrantRequest {
            peer: "p".to_string(),
            kind: CommandKind::Playback,
            token: None,
        };
        let json = String::from_utf8(grant.to_payload().unwrap()).unwrap();
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_table_update_roundtrip() {
        let update = TableUpdate::UpdatePlayback {
            name: "player".to_string(),
            state: PlaybackState::Playing,
            position: 10_000,
        };
        let payload = update.to_payload().unwrap();
        let back: TableUpdate = serde_json::from_slice(&payload).unwrap();
        assert_eq!(back, update);
    }

    #[test]
    fn test_table_update_tagged_encoding() {
        let update = TableUpdate::SetLatest {
            name: "player".to_string(),
        };
        let json = String::from_utf8(update.to_payload().unwrap()).unwrap();
        assert!(json.contains("\"op\":\"set_latest\""));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let update = TableUpdate::RegisterServer {
            name: "n".repeat(MAX_PAYLOAD_SIZE),
        };
        assert!(matches!(
            update.to_payload(),
            Err(PayloadError::TooLarge(_))
        ));
    }
}
