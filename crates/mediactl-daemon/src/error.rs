//! Error types for the mediactl daemon.

/// Errors that can occur while running the daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope codec error
    #[error("codec error: {0}")]
    Codec(#[from] mediactl_ipc::CodecError),

    /// Table store error
    #[error("store error: {0}")]
    Store(mediactl_types::Error),

    /// Another daemon already answers on the socket
    #[error("another daemon is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, DaemonError>;
