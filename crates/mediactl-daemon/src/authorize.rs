//! Authorization seam.
//!
//! The daemon never interprets credentials itself; it asks an [`Authorizer`]
//! whether the connecting peer holds the privilege a request needs. The
//! mechanism behind the answer is out of scope here.

use tokio::net::UnixStream;

use crate::error::{DaemonError, Result};

/// Capability a request must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Apply a mutation to the shared table.
    StorageWrite,
    /// Record a command grant (client side).
    ClientCommand,
    /// Consume a command grant (server side).
    ServerCommand,
}

/// Socket-level identity of the connecting peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
}

/// Read `SO_PEERCRED` off an accepted connection.
pub fn peer_credentials(stream: &UnixStream) -> Result<PeerCredentials> {
    let creds =
        nix::sys::socket::getsockopt(stream, nix::sys::socket::sockopt::PeerCredentials)
            .map_err(|e| DaemonError::Io(e.into()))?;
    Ok(PeerCredentials {
        pid: creds.pid(),
        uid: creds.uid(),
    })
}

/// Decides whether a peer holds a privilege.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, peer: &PeerCredentials, privilege: Privilege) -> bool;
}

/// Grants everything; the default for single-user deployments.
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _peer: &PeerCredentials, _privilege: Privilege) -> bool {
        true
    }
}

/// Denies everything; used to exercise the rejection paths.
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn authorize(&self, _peer: &PeerCredentials, _privilege: Privilege) -> bool {
        false
    }
}
