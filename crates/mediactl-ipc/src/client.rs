//! One-shot control-plane client.
//!
//! Each request opens a fresh connection to the daemon socket, sends exactly
//! one envelope, and blocks for exactly one status-code reply under a
//! bounded receive timeout. The connection is dropped on every exit path.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::codec::Encoder;
use tracing::{debug, trace, warn};

use mediactl_types::Error;

use crate::protocol::{Envelope, MessageType};
use crate::transport::{CodecError, EnvelopeCodec, MAX_PAYLOAD_SIZE};

/// Receive timeout for the single status-code read.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How many timed-out reads are tolerated before the request fails.
const RECV_RETRY_BUDGET: u32 = 3;

/// Service-activation probe: attempts and poll interval.
const ACTIVATION_ATTEMPTS: u32 = 20;
const ACTIVATION_POLL: Duration = Duration::from_millis(250);

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(|_| std::env::temp_dir(), PathBuf::from)
}

/// Well-known daemon socket path.
///
/// Prefers `$XDG_RUNTIME_DIR`, falling back to the system temp directory.
#[must_use]
pub fn socket_path() -> PathBuf {
    runtime_dir().join("mediactl.sock")
}

/// Errors that can occur on a control-plane request.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("payload too large: {0} bytes (max: {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),

    #[error("receive retry budget exhausted")]
    RetriesExhausted,

    #[error("daemon not reachable")]
    ServiceUnavailable,

    #[error("daemon refused request: {0}")]
    Daemon(Error),
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::PayloadTooLarge(_) => Error::InvalidParameter,
            ClientError::Daemon(e) => e,
            ClientError::Io(_)
            | ClientError::Codec(_)
            | ClientError::RetriesExhausted
            | ClientError::ServiceUnavailable => Error::InvalidOperation,
        }
    }
}

/// Client side of the control-socket protocol.
#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    /// Client for the well-known daemon socket.
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: socket_path(),
        }
    }

    /// Client for a custom socket path.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Send one request and wait for the single status-code reply.
    ///
    /// The payload bound is enforced before any socket is opened. A
    /// non-zero status maps onto the shared error taxonomy.
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` on an oversized payload, `Io` when the daemon is
    /// unreachable or the stream fails, `RetriesExhausted` after the
    /// receive-timeout budget is spent, `Daemon` for daemon-reported codes.
    pub async fn request(
        &self,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ClientError::PayloadTooLarge(payload.len()));
        }

        let mut stream = UnixStream::connect(&self.path).await?;

        let envelope = Envelope::request(msg_type, payload.to_vec());
        let mut buf = BytesMut::new();
        EnvelopeCodec::new().encode(envelope, &mut buf)?;
        stream.write_all(&buf).await?;

        let status = read_status(&mut stream).await?;
        trace!(?msg_type, status, "control request answered");

        Error::from_code(status).map_err(ClientError::Daemon)
    }

    /// One-shot service-activation probe.
    ///
    /// Connecting to the well-known socket triggers socket activation when
    /// an activation manager is listening; the connection is dropped
    /// immediately and readiness is then polled with a bounded retry count.
    ///
    /// # Errors
    ///
    /// `ServiceUnavailable` when the daemon never becomes reachable within
    /// the poll budget.
    pub async fn activate(&self) -> Result<(), ClientError> {
        drop(UnixStream::connect(&self.path).await);

        for attempt in 0..ACTIVATION_ATTEMPTS {
            if UnixStream::connect(&self.path).await.is_ok() {
                debug!(attempt, "daemon ready");
                return Ok(());
            }
            tokio::time::sleep(ACTIVATION_POLL).await;
        }

        warn!(path = %self.path.display(), "daemon did not become ready");
        Err(ClientError::ServiceUnavailable)
    }
}

impl Default for ControlClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Read exactly one big-endian `i32` status code.
///
/// Interrupted reads are retried without consuming the budget; timed-out
/// reads are retried up to [`RECV_RETRY_BUDGET`] times.
async fn read_status(stream: &mut UnixStream) -> Result<i32, ClientError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    let mut timeouts = 0;

    while filled < buf.len() {
        match tokio::time::timeout(RECEIVE_TIMEOUT, stream.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => {
                return Err(ClientError::Io(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "daemon closed connection before replying",
                )));
            }
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => {
                trace!("status read interrupted, retrying");
            }
            Ok(Err(e)) if e.kind() == ErrorKind::WouldBlock => {
                timeouts += 1;
                if timeouts >= RECV_RETRY_BUDGET {
                    return Err(ClientError::RetriesExhausted);
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_elapsed) => {
                timeouts += 1;
                warn!(timeouts, "status read timed out");
                if timeouts >= RECV_RETRY_BUDGET {
                    return Err(ClientError::RetriesExhausted);
                }
            }
        }
    }

    Ok(i32::from_be_bytes(buf))
}
