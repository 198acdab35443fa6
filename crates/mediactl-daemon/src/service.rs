//! The daemon service loop.
//!
//! Single privileged instance owning the shared table, the permission
//! grants, and the live-connection counter. Lifecycle:
//! `Starting` (bind socket, reset tables) → `Serving` (one request and one
//! status reply per connection) → `Draining` (idle timer saw a zero
//! connection count) → `Stopped`. The idle timer is the only
//! self-termination path; while the counter is -1 (never seen) or positive
//! a tick merely reschedules.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, trace, warn};

use mediactl_core::TableStore;
use mediactl_ipc::{
    CONNECT_MSG, DISCONNECT_MSG, Envelope, EnvelopeCodec, GrantRequest, MessageType, TableUpdate,
};
use mediactl_types::{Error, STATUS_NONE};

use crate::authorize::{AllowAll, Authorizer, PeerCredentials, Privilege, peer_credentials};
use crate::error::{DaemonError, Result};
use crate::grants::{Grant, GrantTable};

/// Idle-timer period in the deployed configuration.
pub const IDLE_PERIOD: Duration = Duration::from_secs(60);

/// Lifecycle of the service loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// Daemon configuration.
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub table_path: PathBuf,
    pub idle_period: Duration,
    pub authorizer: Arc<dyn Authorizer>,
}

impl DaemonConfig {
    /// Well-known paths, 60-second idle period, allow-all authorization.
    #[must_use]
    pub fn new() -> Self {
        Self {
            socket_path: mediactl_ipc::socket_path(),
            table_path: mediactl_core::table_path(),
            idle_period: IDLE_PERIOD,
            authorizer: Arc::new(AllowAll),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable daemon state; one lock guards every check-then-act sequence.
pub struct DaemonState {
    store: TableStore,
    grants: GrantTable,
    /// -1 until the first connection announcement, then the live count.
    connections: i32,
    state: ServiceState,
}

impl DaemonState {
    #[must_use]
    pub fn connections(&self) -> i32 {
        self.connections
    }

    #[must_use]
    pub fn state(&self) -> ServiceState {
        self.state
    }
}

/// Run the daemon until the idle timer tears it down.
///
/// # Errors
///
/// Socket setup and table-reset failures; `AlreadyRunning` when a live
/// daemon already answers on the socket.
pub async fn run(config: DaemonConfig) -> Result<()> {
    cleanup_stale_socket(&config.socket_path).await?;

    let listener = UnixListener::bind(&config.socket_path)?;
    // Any local process may talk to the daemon; authorization happens
    // per-request, not at connect time.
    std::fs::set_permissions(
        &config.socket_path,
        std::fs::Permissions::from_mode(0o666),
    )?;
    info!(path = %config.socket_path.display(), "daemon listening");

    let mut store = TableStore::open(config.table_path.clone());
    store.reset().map_err(DaemonError::Store)?;
    debug!(path = %config.table_path.display(), "tables reset");

    let state = Arc::new(Mutex::new(DaemonState {
        store,
        grants: GrantTable::new(),
        connections: -1,
        state: ServiceState::Serving,
    }));

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let timer_state = Arc::clone(&state);
    tokio::spawn(async move {
        idle_timer(timer_state, config.idle_period, shutdown_tx).await;
    });

    info!("ready to accept connections");
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let state = Arc::clone(&state);
                    let authorizer = Arc::clone(&config.authorizer);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &state, authorizer.as_ref()).await {
                            warn!(error = %e, "connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept error");
                }
            },
            _ = shutdown_rx.changed() => {
                info!("idle shutdown");
                break;
            }
        }
    }

    {
        let mut guard = state.lock().await;
        guard.state = ServiceState::Stopped;
    }

    if config.socket_path.exists()
        && let Err(e) = std::fs::remove_file(&config.socket_path)
    {
        warn!(path = %config.socket_path.display(), error = %e, "failed to remove socket file");
    }

    Ok(())
}

async fn cleanup_stale_socket(path: &Path) -> Result<()> {
    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(DaemonError::AlreadyRunning);
        }
        info!(path = %path.display(), "removing stale socket");
        std::fs::remove_file(path)?;
    }
    Ok(())
}

/// Recurring idle check. A count of -1 (never seen) or above zero is a
/// benign reschedule; exactly zero drains the service loop.
async fn idle_timer(
    state: Arc<Mutex<DaemonState>>,
    period: Duration,
    shutdown_tx: watch::Sender<bool>,
) {
    let mut interval = tokio::time::interval(period);
    // The first tick of a tokio interval fires immediately; the idle check
    // starts one full period after startup.
    interval.tick().await;

    loop {
        interval.tick().await;
        let mut guard = state.lock().await;
        match guard.connections {
            0 => {
                guard.state = ServiceState::Draining;
                drop(guard);
                let _ = shutdown_tx.send(true);
                break;
            }
            n => {
                trace!(connections = n, "idle check rescheduled");
            }
        }
    }
}

/// Serve one connection: one envelope in, one status code out.
async fn handle_connection(
    stream: UnixStream,
    state: &Mutex<DaemonState>,
    authorizer: &dyn Authorizer,
) -> Result<()> {
    let creds = peer_credentials(&stream)?;
    let mut framed = Framed::new(stream, EnvelopeCodec::new());

    let status = match framed.next().await {
        None => return Ok(()),
        Some(Ok(envelope)) => {
            let mut guard = state.lock().await;
            dispatch(&mut guard, authorizer, &creds, &envelope)
        }
        Some(Err(e)) => {
            warn!(error = %e, "malformed request");
            Error::InvalidOperation.code()
        }
    };

    let mut stream = framed.into_inner();
    stream.write_all(&status.to_be_bytes()).await?;
    Ok(())
}

fn dispatch(
    state: &mut DaemonState,
    authorizer: &dyn Authorizer,
    creds: &PeerCredentials,
    envelope: &Envelope,
) -> i32 {
    match envelope.msg_type {
        MessageType::DbUpdate => {
            if !authorizer.authorize(creds, Privilege::StorageWrite) {
                return Error::PermissionDenied.code();
            }
            let Ok(update) = serde_json::from_slice::<TableUpdate>(&envelope.payload) else {
                warn!(pid = envelope.pid, "malformed table update");
                return Error::InvalidParameter.code();
            };
            match state.store.apply(&update) {
                Ok(()) => STATUS_NONE,
                Err(e) => {
                    warn!(pid = envelope.pid, error = %e, "table update failed");
                    e.code()
                }
            }
        }

        MessageType::ClientSet => {
            if !authorizer.authorize(creds, Privilege::ClientCommand) {
                return Error::PermissionDenied.code();
            }
            let Ok(request) = serde_json::from_slice::<GrantRequest>(&envelope.payload) else {
                return Error::InvalidParameter.code();
            };
            state.grants.insert(Grant {
                pid: envelope.pid,
                peer: request.peer,
                kind: request.kind,
                token: request.token,
            });
            STATUS_NONE
        }

        MessageType::ClientGet => {
            if !authorizer.authorize(creds, Privilege::ServerCommand) {
                return Error::PermissionDenied.code();
            }
            let Ok(request) = serde_json::from_slice::<GrantRequest>(&envelope.payload) else {
                return Error::InvalidParameter.code();
            };
            if state.grants.consume(&request) {
                STATUS_NONE
            } else {
                Error::PermissionDenied.code()
            }
        }

        MessageType::ServerConnection => match envelope.payload_str() {
            Some(CONNECT_MSG) => {
                state.connections = if state.connections == -1 {
                    1
                } else {
                    state.connections + 1
                };
                info!(connections = state.connections, "connection announced");
                STATUS_NONE
            }
            _ => {
                warn!(pid = envelope.pid, "bad connection sentinel");
                Error::InvalidOperation.code()
            }
        },

        MessageType::ServerDisconnection => match envelope.payload_str() {
            Some(DISCONNECT_MSG) => {
                state.connections -= 1;
                let purged = state.grants.purge_pid(envelope.pid);
                info!(
                    connections = state.connections,
                    purged, "disconnection announced"
                );
                STATUS_NONE
            }
            _ => {
                warn!(pid = envelope.pid, "bad disconnection sentinel");
                Error::InvalidOperation.code()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediactl_ipc::CommandKind;

    const PEER: PeerCredentials = PeerCredentials { pid: 77, uid: 1000 };

    fn scratch_state() -> (tempfile::TempDir, DaemonState) {
        let dir = tempfile::tempdir().unwrap();
        let store = TableStore::open(dir.path().join("tables.json"));
        (
            dir,
            DaemonState {
                store,
                grants: GrantTable::new(),
                connections: -1,
                state: ServiceState::Serving,
            },
        )
    }

    fn envelope(msg_type: MessageType, payload: &[u8]) -> Envelope {
        Envelope {
            msg_type,
            pid: PEER.pid,
            uid: PEER.uid,
            result: 0,
            payload: payload.to_vec(),
        }
    }

    fn grant_payload(peer: &str, kind: CommandKind, token: Option<&str>) -> Vec<u8> {
        GrantRequest {
            peer: peer.to_string(),
            kind,
            token: token.map(String::from),
        }
        .to_payload()
        .unwrap()
    }

    #[test]
    fn test_connection_counter_edges() {
        let (_dir, mut state) = scratch_state();
        assert_eq!(state.connections(), -1);

        let status = dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::ServerConnection, CONNECT_MSG.as_bytes()),
        );
        assert_eq!(status, STATUS_NONE);
        assert_eq!(state.connections(), 1, "first sight jumps -1 to 1");

        dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::ServerConnection, CONNECT_MSG.as_bytes()),
        );
        assert_eq!(state.connections(), 2);

        dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::ServerDisconnection, DISCONNECT_MSG.as_bytes()),
        );
        assert_eq!(state.connections(), 1);
    }

    #[test]
    fn test_wrong_sentinel_rejected() {
        let (_dir, mut state) = scratch_state();
        let status = dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::ServerConnection, b"Hello"),
        );
        assert_eq!(status, Error::InvalidOperation.code());
        assert_eq!(state.connections(), -1, "counter untouched");
    }

    #[test]
    fn test_set_get_consumes_grant() {
        let (_dir, mut state) = scratch_state();
        let payload = grant_payload("peerA", CommandKind::Custom, Some("cmd1"));

        let status = dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::ClientSet, &payload),
        );
        assert_eq!(status, STATUS_NONE);

        let status = dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::ClientGet, &payload),
        );
        assert_eq!(status, STATUS_NONE);

        let status = dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::ClientGet, &payload),
        );
        assert_eq!(
            status,
            Error::PermissionDenied.code(),
            "second get finds the grant consumed"
        );
    }

    #[test]
    fn test_disconnect_purges_grants() {
        let (_dir, mut state) = scratch_state();
        let payload = grant_payload("peerA", CommandKind::Playback, None);

        dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::ClientSet, &payload),
        );
        dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::ServerDisconnection, DISCONNECT_MSG.as_bytes()),
        );

        let status = dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::ClientGet, &payload),
        );
        assert_eq!(status, Error::PermissionDenied.code());
    }

    #[test]
    fn test_denied_client_set() {
        let (_dir, mut state) = scratch_state();
        let payload = grant_payload("peerA", CommandKind::Playback, None);

        let status = dispatch(
            &mut state,
            &crate::authorize::DenyAll,
            &PEER,
            &envelope(MessageType::ClientSet, &payload),
        );
        assert_eq!(status, Error::PermissionDenied.code());
        assert!(state.grants.is_empty());
    }

    #[test]
    fn test_db_update_applies() {
        let (_dir, mut state) = scratch_state();
        let payload = TableUpdate::RegisterServer {
            name: "player".to_string(),
        }
        .to_payload()
        .unwrap();

        let status = dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::DbUpdate, &payload),
        );
        assert_eq!(status, STATUS_NONE);
        assert!(state.store.is_registered("player"));
    }

    #[test]
    fn test_malformed_db_update_rejected() {
        let (_dir, mut state) = scratch_state();
        let status = dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::DbUpdate, b"DROP TABLE servers"),
        );
        assert_eq!(status, Error::InvalidParameter.code());
    }

    #[test]
    fn test_db_update_unknown_server_status() {
        let (_dir, mut state) = scratch_state();
        let payload = TableUpdate::UpdateShuffle {
            name: "ghost".to_string(),
            mode: mediactl_types::ShuffleMode::On,
        }
        .to_payload()
        .unwrap();

        let status = dispatch(
            &mut state,
            &AllowAll,
            &PEER,
            &envelope(MessageType::DbUpdate, &payload),
        );
        assert_eq!(status, Error::InvalidParameter.code());
    }
}
