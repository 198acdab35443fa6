//! Integration tests for the mediactl daemon.
//!
//! These run a real daemon on a scratch socket and drive it through the
//! control-plane client and the server/client handles.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use mediactl_core::{Bus, ControllerContext, MediaClient, MediaServer};
use mediactl_daemon::{AllowAll, Authorizer, DaemonConfig, DenyAll};
use mediactl_ipc::{
    CONNECT_MSG, CommandKind, ControlClient, DISCONNECT_MSG, GrantRequest, MessageType,
    TableUpdate,
};
use mediactl_types::{Error, Metadata, PlaybackState, ServerState, ShuffleMode};

struct TestDaemon {
    socket_path: PathBuf,
    table_path: PathBuf,
    handle: JoinHandle<mediactl_daemon::Result<()>>,
    _dir: tempfile::TempDir,
}

impl TestDaemon {
    async fn start(idle_period: Duration, authorizer: Arc<dyn Authorizer>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("mediactl.sock");
        let table_path = dir.path().join("tables.json");

        let config = DaemonConfig {
            socket_path: socket_path.clone(),
            table_path: table_path.clone(),
            idle_period,
            authorizer,
        };
        let handle = tokio::spawn(mediactl_daemon::run(config));

        let client = ControlClient::with_path(socket_path.clone());
        client.activate().await.expect("daemon did not come up");

        Self {
            socket_path,
            table_path,
            handle,
            _dir: dir,
        }
    }

    fn control(&self) -> ControlClient {
        ControlClient::with_path(self.socket_path.clone())
    }

    fn context(&self) -> Arc<ControllerContext> {
        Arc::new(ControllerContext::with_paths(
            self.socket_path.clone(),
            self.table_path.clone(),
        ))
    }
}

const LONG_IDLE: Duration = Duration::from_secs(600);

fn grant_payload(peer: &str, kind: CommandKind, token: Option<&str>) -> Vec<u8> {
    GrantRequest {
        peer: peer.to_string(),
        kind,
        token: token.map(String::from),
    }
    .to_payload()
    .unwrap()
}

#[tokio::test]
async fn test_socket_is_world_writable() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let mode = std::fs::metadata(&daemon.socket_path)
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o666);
    daemon.handle.abort();
}

#[tokio::test]
async fn test_connection_handshake_roundtrip() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let control = daemon.control();

    control
        .request(MessageType::ServerConnection, CONNECT_MSG.as_bytes())
        .await
        .unwrap();
    control
        .request(MessageType::ServerDisconnection, DISCONNECT_MSG.as_bytes())
        .await
        .unwrap();

    daemon.handle.abort();
}

#[tokio::test]
async fn test_wrong_sentinel_rejected() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let control = daemon.control();

    let err = control
        .request(MessageType::ServerConnection, b"Howdy")
        .await
        .unwrap_err();
    assert_eq!(Error::from(err), Error::InvalidOperation);

    daemon.handle.abort();
}

#[tokio::test]
async fn test_grant_set_get_consumed_once() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let control = daemon.control();
    let payload = grant_payload("peerA", CommandKind::Custom, Some("cmd1"));

    control
        .request(MessageType::ClientSet, &payload)
        .await
        .unwrap();
    control
        .request(MessageType::ClientGet, &payload)
        .await
        .unwrap();

    let err = control
        .request(MessageType::ClientGet, &payload)
        .await
        .unwrap_err();
    assert_eq!(Error::from(err), Error::PermissionDenied);

    daemon.handle.abort();
}

#[tokio::test]
async fn test_disconnect_purges_pid_grants() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let control = daemon.control();
    let payload = grant_payload("peerA", CommandKind::Playback, None);

    control
        .request(MessageType::ServerConnection, CONNECT_MSG.as_bytes())
        .await
        .unwrap();
    control
        .request(MessageType::ClientSet, &payload)
        .await
        .unwrap();
    // Same process id: the disconnect sweeps the grant recorded above.
    control
        .request(MessageType::ServerDisconnection, DISCONNECT_MSG.as_bytes())
        .await
        .unwrap();

    let err = control
        .request(MessageType::ClientGet, &payload)
        .await
        .unwrap_err();
    assert_eq!(Error::from(err), Error::PermissionDenied);

    daemon.handle.abort();
}

#[tokio::test]
async fn test_deny_all_authorizer_blocks_grant_paths() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(DenyAll)).await;
    let control = daemon.control();
    let payload = grant_payload("peerA", CommandKind::Playback, None);

    let err = control
        .request(MessageType::ClientSet, &payload)
        .await
        .unwrap_err();
    assert_eq!(Error::from(err), Error::PermissionDenied);

    let err = control
        .request(MessageType::DbUpdate, &payload)
        .await
        .unwrap_err();
    assert_eq!(Error::from(err), Error::PermissionDenied);

    daemon.handle.abort();
}

#[tokio::test]
async fn test_db_update_lands_in_table_file() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let control = daemon.control();

    let register = TableUpdate::RegisterServer {
        name: "player".to_string(),
    }
    .to_payload()
    .unwrap();
    control
        .request(MessageType::DbUpdate, &register)
        .await
        .unwrap();

    let update = TableUpdate::UpdatePlayback {
        name: "player".to_string(),
        state: PlaybackState::Playing,
        position: 42,
    }
    .to_payload()
    .unwrap();
    control
        .request(MessageType::DbUpdate, &update)
        .await
        .unwrap();

    let store = mediactl_core::TableStore::open(daemon.table_path.clone());
    assert!(store.is_registered("player"));
    assert_eq!(
        store.playback("player").unwrap().state,
        PlaybackState::Playing
    );

    daemon.handle.abort();
}

#[tokio::test]
async fn test_malformed_db_update_rejected() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let control = daemon.control();

    let err = control
        .request(MessageType::DbUpdate, b"DELETE FROM servers;")
        .await
        .unwrap_err();
    assert_eq!(Error::from(err), Error::InvalidParameter);

    daemon.handle.abort();
}

#[tokio::test]
async fn test_daemon_resets_tables_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let table_path = dir.path().join("tables.json");

    // Leftover state from a previous run.
    let mut stale = mediactl_core::TableStore::open(table_path.clone());
    stale
        .apply(&TableUpdate::RegisterServer {
            name: "old".to_string(),
        })
        .unwrap();

    let config = DaemonConfig {
        socket_path: dir.path().join("mediactl.sock"),
        table_path: table_path.clone(),
        idle_period: LONG_IDLE,
        authorizer: Arc::new(AllowAll),
    };
    let handle = tokio::spawn(mediactl_daemon::run(config));
    ControlClient::with_path(dir.path().join("mediactl.sock"))
        .activate()
        .await
        .unwrap();

    let store = mediactl_core::TableStore::open(table_path);
    assert!(!store.is_registered("old"), "tables recreated at startup");

    handle.abort();
}

#[tokio::test]
async fn test_idle_shutdown_after_last_disconnect() {
    let daemon = TestDaemon::start(Duration::from_millis(150), Arc::new(AllowAll)).await;
    let control = daemon.control();

    control
        .request(MessageType::ServerConnection, CONNECT_MSG.as_bytes())
        .await
        .unwrap();
    control
        .request(MessageType::ServerDisconnection, DISCONNECT_MSG.as_bytes())
        .await
        .unwrap();

    // Counter is 0: the next tick drains the loop and the task finishes.
    let result = tokio::time::timeout(Duration::from_secs(2), daemon.handle)
        .await
        .expect("daemon did not shut down")
        .unwrap();
    result.unwrap();
    assert!(!daemon.socket_path.exists(), "socket file removed");
}

#[tokio::test]
async fn test_idle_timer_reschedules_when_never_seen() {
    let daemon = TestDaemon::start(Duration::from_millis(100), Arc::new(AllowAll)).await;

    // Several periods pass with the counter at -1; the daemon stays up.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(!daemon.handle.is_finished());

    let control = daemon.control();
    control
        .request(MessageType::ServerConnection, CONNECT_MSG.as_bytes())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(
        !daemon.handle.is_finished(),
        "positive counter also reschedules"
    );

    control
        .request(MessageType::ServerDisconnection, DISCONNECT_MSG.as_bytes())
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), daemon.handle)
        .await
        .expect("daemon did not shut down")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_second_daemon_refuses_to_start() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;

    let config = DaemonConfig {
        socket_path: daemon.socket_path.clone(),
        table_path: daemon.table_path.clone(),
        idle_period: LONG_IDLE,
        authorizer: Arc::new(AllowAll),
    };
    let err = mediactl_daemon::run(config).await.unwrap_err();
    assert!(matches!(err, mediactl_daemon::DaemonError::AlreadyRunning));

    daemon.handle.abort();
}

#[tokio::test]
async fn test_end_to_end_playback_update() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let ctx = daemon.context();

    let server = MediaServer::create_with_identity(Arc::clone(&ctx), "player")
        .await
        .unwrap();
    let client = MediaClient::create_with_identity(Arc::clone(&ctx), "remote")
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .set_playback_update_cb(move |sender, playback| {
            let _ = tx.send((sender.to_string(), playback));
        })
        .unwrap();

    server.set_playback_state(PlaybackState::Playing).unwrap();
    server.set_playback_position(10_000);
    server.update_playback_info().await.unwrap();

    let (sender, playback) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no playback update delivered")
        .unwrap();
    assert_eq!(sender, "player");
    assert_eq!(playback.state, PlaybackState::Playing);
    assert_eq!(playback.position, 10_000);

    // PLAYING also moved the latest pointer.
    let (latest, state) = client.latest_server_info();
    assert_eq!(latest.as_deref(), Some("player"));
    assert_eq!(state, ServerState::Activated);

    client.destroy().await.unwrap();
    server.destroy().await.unwrap();
    daemon.handle.abort();
}

#[tokio::test]
async fn test_end_to_end_playback_command_consumes_grant() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let ctx = daemon.context();

    let server = MediaServer::create_with_identity(Arc::clone(&ctx), "player")
        .await
        .unwrap();
    let client = MediaClient::create_with_identity(Arc::clone(&ctx), "remote")
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .set_playback_command_cb(move |sender, state| {
            let _ = tx.send((sender.to_string(), state));
        })
        .unwrap();

    client
        .send_playback_state_command("player", PlaybackState::Paused)
        .await
        .unwrap();

    let (sender, state) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("command not delivered")
        .unwrap();
    assert_eq!(sender, "remote");
    assert_eq!(state, PlaybackState::Paused);

    // The grant was consumed by the delivery check.
    let control = daemon.control();
    let err = control
        .request(
            MessageType::ClientGet,
            &grant_payload("remote", CommandKind::Playback, None),
        )
        .await
        .unwrap_err();
    assert_eq!(Error::from(err), Error::PermissionDenied);

    client.destroy().await.unwrap();
    server.destroy().await.unwrap();
    daemon.handle.abort();
}

#[tokio::test]
async fn test_end_to_end_unauthorized_command_dropped() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let ctx = daemon.context();

    let server = MediaServer::create_with_identity(Arc::clone(&ctx), "player")
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .set_playback_command_cb(move |sender, state| {
            let _ = tx.send((sender.to_string(), state));
        })
        .unwrap();

    // Publish a command directly, with no CLIENT_SET declaration: the
    // server's grant check fails and the callback never runs.
    let bus = ctx.bus().acquire().unwrap();
    bus.publish(
        "org.mediactl.server.player",
        mediactl_core::SignalName::PlaybackStateCommand,
        &mediactl_core::SignalPayload::PlaybackCommand {
            sender: "intruder".to_string(),
            state: PlaybackState::Stopped,
        },
    )
    .unwrap();

    let delivered = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(delivered.is_err(), "unauthorized command must be dropped");

    ctx.bus().release().unwrap();
    server.destroy().await.unwrap();
    daemon.handle.abort();
}

#[tokio::test]
async fn test_end_to_end_custom_command_reply() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let ctx = daemon.context();

    let server = Arc::new(
        MediaServer::create_with_identity(Arc::clone(&ctx), "player")
            .await
            .unwrap(),
    );
    let client = MediaClient::create_with_identity(Arc::clone(&ctx), "remote")
        .await
        .unwrap();

    let replier = Arc::clone(&server);
    server
        .set_custom_command_cb(move |sender, command, data| {
            assert_eq!(command, "jump_to");
            assert_eq!(data.unwrap()["track"], 3);
            let _ = replier.send_command_reply(sender, 0, Some(serde_json::json!({"ok": true})));
        })
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .set_command_reply_cb(move |sender, result_code, data| {
            let _ = tx.send((sender.to_string(), result_code, data.cloned()));
        })
        .unwrap();

    client
        .send_custom_command("player", "jump_to", Some(serde_json::json!({"track": 3})))
        .await
        .unwrap();

    let (sender, result_code, data) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no reply delivered")
        .unwrap();
    assert_eq!(sender, "player");
    assert_eq!(result_code, 0);
    assert_eq!(data.unwrap()["ok"], true);

    client.destroy().await.unwrap();

    // Dropping the command listener releases the Arc the reply closure held.
    server.unset_custom_command_cb().unwrap();
    let Ok(server) = Arc::try_unwrap(server) else {
        panic!("server still referenced");
    };
    server.destroy().await.unwrap();
    daemon.handle.abort();
}

#[tokio::test]
async fn test_end_to_end_metadata_and_modes() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let ctx = daemon.context();

    let server = MediaServer::create_with_identity(Arc::clone(&ctx), "player")
        .await
        .unwrap();
    let client = MediaClient::create_with_identity(Arc::clone(&ctx), "remote")
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .set_metadata_update_cb(move |sender, metadata| {
            let _ = tx.send((sender.to_string(), metadata));
        })
        .unwrap();

    server.set_metadata(
        mediactl_types::MetadataAttribute::Title,
        Some("Freddie Freeloader"),
    );
    server.set_metadata(mediactl_types::MetadataAttribute::TrackNum, Some("2"));
    server.update_metadata().await.unwrap();

    let (sender, metadata): (String, Metadata) =
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no metadata update delivered")
            .unwrap();
    assert_eq!(sender, "player");
    assert_eq!(metadata.title.as_deref(), Some("Freddie Freeloader"));

    server
        .update_shuffle_mode(ShuffleMode::On)
        .await
        .unwrap();
    assert_eq!(
        client.server_shuffle_mode("player").unwrap(),
        ShuffleMode::On
    );

    client.destroy().await.unwrap();
    server.destroy().await.unwrap();
    daemon.handle.abort();
}

#[tokio::test]
async fn test_end_to_end_filtered_subscription() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let ctx = daemon.context();

    let server_a = MediaServer::create_with_identity(Arc::clone(&ctx), "playerA")
        .await
        .unwrap();
    let server_b = MediaServer::create_with_identity(Arc::clone(&ctx), "playerB")
        .await
        .unwrap();
    let client = MediaClient::create_with_identity(Arc::clone(&ctx), "remote")
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .set_playback_update_cb(move |sender, playback| {
            let _ = tx.send((sender.to_string(), playback.position));
        })
        .unwrap();
    client
        .subscribe(mediactl_types::SubscriptionType::Playback, "playerA")
        .unwrap();

    let mut subscribed = Vec::new();
    client
        .foreach_server_subscribed(mediactl_types::SubscriptionType::Playback, |peer| {
            subscribed.push(peer.to_string());
            true
        })
        .unwrap();
    assert_eq!(subscribed, vec!["playerA"]);

    server_b.set_playback_state(PlaybackState::Playing).unwrap();
    server_b.set_playback_position(500);
    server_b.update_playback_info().await.unwrap();

    server_a.set_playback_state(PlaybackState::Playing).unwrap();
    server_a.set_playback_position(900);
    server_a.update_playback_info().await.unwrap();

    // Only the subscribed server's update arrives.
    let (sender, position) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no update delivered")
        .unwrap();
    assert_eq!(sender, "playerA");
    assert_eq!(position, 900);
    assert!(rx.try_recv().is_err());

    client.destroy().await.unwrap();
    server_a.destroy().await.unwrap();
    server_b.destroy().await.unwrap();
    daemon.handle.abort();
}

#[tokio::test]
async fn test_end_to_end_latest_server_survives_destroy() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let ctx = daemon.context();

    let server = MediaServer::create_with_identity(Arc::clone(&ctx), "player")
        .await
        .unwrap();
    server.set_playback_state(PlaybackState::Playing).unwrap();
    server.update_playback_info().await.unwrap();
    server.destroy().await.unwrap();

    // The latest server's row is soft-deactivated, not deleted, so a late
    // client still reads its last-known state.
    let client = MediaClient::create_with_identity(Arc::clone(&ctx), "late-remote")
        .await
        .unwrap();
    let (latest, state) = client.latest_server_info();
    assert_eq!(latest.as_deref(), Some("player"));
    assert_eq!(state, ServerState::Deactivated);
    assert_eq!(
        client.server_playback_info("player").unwrap().state,
        PlaybackState::Playing
    );
    let mut listed = Vec::new();
    client.foreach_server(|name| {
        listed.push(name.to_string());
        true
    });
    assert!(listed.is_empty(), "deactivated server left the known list");

    client.destroy().await.unwrap();
    daemon.handle.abort();
}

#[tokio::test]
async fn test_duplicate_server_identity_rejected() {
    let daemon = TestDaemon::start(LONG_IDLE, Arc::new(AllowAll)).await;
    let ctx = daemon.context();

    let first = MediaServer::create_with_identity(Arc::clone(&ctx), "player")
        .await
        .unwrap();
    let err = MediaServer::create_with_identity(Arc::clone(&ctx), "player")
        .await
        .unwrap_err();
    assert_eq!(err, Error::InvalidOperation);

    first.destroy().await.unwrap();
    daemon.handle.abort();
}
