//! Control-socket protocol for the mediactl daemon.
//!
//! This crate provides the fixed-layout request envelope, its codec, the
//! structured request payloads, and the one-shot client used by server and
//! client handles to reach the daemon.
//!
//! # Architecture
//!
//! - [`protocol`]: envelope and payload types (`MessageType`, `TableUpdate`,
//!   `GrantRequest`, connection sentinels)
//! - [`transport`]: length-prefixed binary codec for the envelope
//! - [`client`]: one-request-per-connection client with bounded retries and
//!   the service-activation probe

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::{ClientError, ControlClient, socket_path};
pub use protocol::{
    CONNECT_MSG, CommandKind, DISCONNECT_MSG, Envelope, GrantRequest, MessageType, PayloadError,
    TableUpdate,
};
pub use transport::{CodecError, EnvelopeCodec, MAX_PAYLOAD_SIZE};
