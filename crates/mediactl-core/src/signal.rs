//! Signal names and notification payloads.
//!
//! Signal names are the fixed wire strings every implementation of the
//! protocol shares. Payload bodies are a tagged enum serialized as JSON;
//! user-supplied text (metadata, custom command data) can therefore contain
//! anything without colliding with the framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mediactl_types::{Error, PlaybackState, RepeatMode, ServerState, ShuffleMode};

/// Signal names delivered on update and command interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalName {
    ServerState,
    Playback,
    Metadata,
    PlaybackShuffle,
    PlaybackRepeat,
    PlaybackStateCommand,
    CustomCommand,
    CommandReply,
}

impl SignalName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SignalName::ServerState => "server_state",
            SignalName::Playback => "playback",
            SignalName::Metadata => "metadata",
            SignalName::PlaybackShuffle => "playback_shuffle",
            SignalName::PlaybackRepeat => "playback_repeat",
            SignalName::PlaybackStateCommand => "playback_state_command",
            SignalName::CustomCommand => "custom_command",
            SignalName::CommandReply => "command_reply",
        }
    }
}

impl std::fmt::Display for SignalName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of a delivered signal. Field `sender` is always the identity of the
/// publishing process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    ServerState {
        sender: String,
        state: ServerState,
    },
    Playback {
        sender: String,
        state: PlaybackState,
        position: u64,
    },
    /// Metadata changed; readers fetch the row for `sender` from the table.
    Metadata { sender: String },
    Shuffle {
        sender: String,
        mode: ShuffleMode,
    },
    Repeat {
        sender: String,
        mode: RepeatMode,
    },
    PlaybackCommand {
        sender: String,
        state: PlaybackState,
    },
    CustomCommand {
        sender: String,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    CommandReply {
        sender: String,
        result_code: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl SignalPayload {
    #[must_use]
    pub fn sender(&self) -> &str {
        match self {
            SignalPayload::ServerState { sender, .. }
            | SignalPayload::Playback { sender, .. }
            | SignalPayload::Metadata { sender }
            | SignalPayload::Shuffle { sender, .. }
            | SignalPayload::Repeat { sender, .. }
            | SignalPayload::PlaybackCommand { sender, .. }
            | SignalPayload::CustomCommand { sender, .. }
            | SignalPayload::CommandReply { sender, .. } => sender,
        }
    }

    /// Encode to the wire body.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when serialization fails.
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|_| Error::InvalidOperation)
    }

    /// Decode a wire body.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on a malformed body.
    pub fn decode(body: &str) -> Result<Self, Error> {
        serde_json::from_str(body).map_err(|_| Error::InvalidParameter)
    }
}

/// One delivered signal: where it arrived and what it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub interface: String,
    pub signal: SignalName,
    pub payload: SignalPayload,
}
