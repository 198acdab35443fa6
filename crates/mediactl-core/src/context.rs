//! Process-wide controller context.
//!
//! Bundles the shared bus connection (with its reference count), the
//! control-plane client, and the table-file location. Handles receive the
//! context explicitly; there is no process-global state.

use std::path::{Path, PathBuf};

use mediactl_ipc::{
    CONNECT_MSG, ControlClient, DISCONNECT_MSG, GrantRequest, MessageType, PayloadError,
    TableUpdate,
};
use mediactl_types::Error;

use crate::bus::BusContext;
use crate::store;

/// Shared state every server and client handle in a process hangs off.
pub struct ControllerContext {
    bus: BusContext,
    control: ControlClient,
    table_path: PathBuf,
}

impl ControllerContext {
    /// Context wired to the well-known daemon socket and table file.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bus: BusContext::new(),
            control: ControlClient::new(),
            table_path: store::table_path(),
        }
    }

    /// Context with explicit socket and table paths.
    #[must_use]
    pub fn with_paths(socket_path: PathBuf, table_path: PathBuf) -> Self {
        Self {
            bus: BusContext::new(),
            control: ControlClient::with_path(socket_path),
            table_path,
        }
    }

    #[must_use]
    pub fn bus(&self) -> &BusContext {
        &self.bus
    }

    #[must_use]
    pub fn control(&self) -> &ControlClient {
        &self.control
    }

    #[must_use]
    pub fn table_path(&self) -> &Path {
        &self.table_path
    }

    /// Send one table mutation to the daemon.
    pub(crate) async fn db_update(&self, update: &TableUpdate) -> Result<(), Error> {
        let payload = update.to_payload().map_err(payload_error)?;
        self.control
            .request(MessageType::DbUpdate, &payload)
            .await
            .map_err(Error::from)
    }

    /// Pre-declare a command this process is about to send (CLIENT_SET).
    pub(crate) async fn declare_command(&self, grant: &GrantRequest) -> Result<(), Error> {
        let payload = grant.to_payload().map_err(payload_error)?;
        self.control
            .request(MessageType::ClientSet, &payload)
            .await
            .map_err(Error::from)
    }

    /// Check and consume a previously declared command (CLIENT_GET).
    pub(crate) async fn check_command(&self, grant: &GrantRequest) -> Result<(), Error> {
        let payload = grant.to_payload().map_err(payload_error)?;
        self.control
            .request(MessageType::ClientGet, &payload)
            .await
            .map_err(Error::from)
    }

    /// Register this process with the daemon's connection counter.
    pub(crate) async fn announce_connect(&self) -> Result<(), Error> {
        self.control
            .request(MessageType::ServerConnection, CONNECT_MSG.as_bytes())
            .await
            .map_err(Error::from)
    }

    /// Withdraw this process from the daemon's connection counter.
    pub(crate) async fn announce_disconnect(&self) -> Result<(), Error> {
        self.control
            .request(MessageType::ServerDisconnection, DISCONNECT_MSG.as_bytes())
            .await
            .map_err(Error::from)
    }
}

impl Default for ControllerContext {
    fn default() -> Self {
        Self::new()
    }
}

fn payload_error(err: PayloadError) -> Error {
    match err {
        PayloadError::TooLarge(_) => Error::InvalidParameter,
        PayloadError::Json(_) => Error::InvalidOperation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let ctx = ControllerContext::new();
        assert!(ctx.control().path().ends_with("mediactl.sock"));
        assert!(ctx.table_path().ends_with("mediactl-tables.json"));
    }

    #[test]
    fn test_with_paths() {
        let ctx = ControllerContext::with_paths(
            PathBuf::from("/tmp/custom.sock"),
            PathBuf::from("/tmp/custom-tables.json"),
        );
        assert_eq!(ctx.control().path(), Path::new("/tmp/custom.sock"));
        assert_eq!(ctx.table_path(), Path::new("/tmp/custom-tables.json"));
    }

    #[tokio::test]
    async fn test_db_update_without_daemon_is_invalid_operation() {
        let ctx = ControllerContext::with_paths(
            PathBuf::from("/nonexistent/mediactl.sock"),
            PathBuf::from("/nonexistent/tables.json"),
        );
        let err = ctx
            .db_update(&TableUpdate::RegisterServer {
                name: "p".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err, Error::InvalidOperation);
    }
}
