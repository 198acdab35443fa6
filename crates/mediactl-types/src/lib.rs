//! Shared types for the mediactl control plane.
//!
//! This crate provides the status-code taxonomy and the playback/metadata
//! data model used across mediactl-ipc, mediactl-core, and mediactl-daemon.
//! All types are serializable for wire transport and table persistence.

use serde::{Deserialize, Serialize};

/// Status codes returned by every public control-plane operation.
///
/// Success is not a variant; `Ok(())` is the `NONE` case and `code()` of a
/// successful reply is [`STATUS_NONE`]. The numeric values are the wire
/// representation carried in the control-socket response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Bad or out-of-range argument, malformed name, rejected duplicate.
    #[error("invalid parameter")]
    InvalidParameter,

    /// Allocation or resource exhaustion.
    #[error("out of memory")]
    OutOfMemory,

    /// I/O failure, protocol desync, bus failure, daemon unreachable.
    #[error("invalid operation")]
    InvalidOperation,

    /// Authorization check failed; never retried.
    #[error("permission denied")]
    PermissionDenied,
}

/// Wire value of a successful reply.
pub const STATUS_NONE: i32 = 0;

impl Error {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Error::InvalidParameter => -1,
            Error::OutOfMemory => -2,
            Error::InvalidOperation => -3,
            Error::PermissionDenied => -4,
        }
    }

    /// Map a wire status back to a result. Unknown negative codes collapse
    /// to `InvalidOperation`; any non-negative code is success.
    #[must_use]
    pub fn from_code(code: i32) -> Result<()> {
        match code {
            c if c >= STATUS_NONE => Ok(()),
            -1 => Err(Error::InvalidParameter),
            -2 => Err(Error::OutOfMemory),
            -4 => Err(Error::PermissionDenied),
            _ => Err(Error::InvalidOperation),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle state of a registered media server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    #[default]
    None,
    Activated,
    Deactivated,
}

/// Playback state published by a server or requested by a client command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    None,
    Playing,
    Paused,
    Stopped,
    NextFile,
    PrevFile,
    FastForward,
    Rewind,
}

impl PlaybackState {
    /// Whether this state is a valid command target. `None` is a table
    /// default only and may not be published or commanded.
    #[must_use]
    pub fn is_commandable(self) -> bool {
        !matches!(self, PlaybackState::None)
    }
}

/// Playback snapshot: state plus position in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playback {
    pub state: PlaybackState,
    pub position: u64,
}

/// Track metadata published by a server. Every field is optional; unset
/// fields persist as `null` in the table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub author: Option<String>,
    pub genre: Option<String>,
    pub duration: Option<String>,
    pub date: Option<String>,
    pub copyright: Option<String>,
    pub description: Option<String>,
    pub track_num: Option<String>,
    pub picture: Option<String>,
}

/// Selector for a single [`Metadata`] field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataAttribute {
    Title,
    Artist,
    Album,
    Author,
    Genre,
    Duration,
    Date,
    Copyright,
    Description,
    TrackNum,
    Picture,
}

impl Metadata {
    #[must_use]
    pub fn get(&self, attribute: MetadataAttribute) -> Option<&str> {
        let field = match attribute {
            MetadataAttribute::Title => &self.title,
            MetadataAttribute::Artist => &self.artist,
            MetadataAttribute::Album => &self.album,
            MetadataAttribute::Author => &self.author,
            MetadataAttribute::Genre => &self.genre,
            MetadataAttribute::Duration => &self.duration,
            MetadataAttribute::Date => &self.date,
            MetadataAttribute::Copyright => &self.copyright,
            MetadataAttribute::Description => &self.description,
            MetadataAttribute::TrackNum => &self.track_num,
            MetadataAttribute::Picture => &self.picture,
        };
        field.as_deref()
    }

    pub fn set(&mut self, attribute: MetadataAttribute, value: Option<String>) {
        let field = match attribute {
            MetadataAttribute::Title => &mut self.title,
            MetadataAttribute::Artist => &mut self.artist,
            MetadataAttribute::Album => &mut self.album,
            MetadataAttribute::Author => &mut self.author,
            MetadataAttribute::Genre => &mut self.genre,
            MetadataAttribute::Duration => &mut self.duration,
            MetadataAttribute::Date => &mut self.date,
            MetadataAttribute::Copyright => &mut self.copyright,
            MetadataAttribute::Description => &mut self.description,
            MetadataAttribute::TrackNum => &mut self.track_num,
            MetadataAttribute::Picture => &mut self.picture,
        };
        *field = value;
    }
}

/// Shuffle mode of a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShuffleMode {
    On,
    #[default]
    Off,
}

/// Repeat mode of a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    On,
    #[default]
    Off,
}

/// Update topics a client can narrow to a single server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    ServerState,
    Playback,
    Metadata,
    ShuffleMode,
    RepeatMode,
}
