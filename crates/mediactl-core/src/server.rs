//! Media server handle.
//!
//! The single active playback process. Creation claims the process identity
//! in the shared table and announces activation; update operations persist
//! through the daemon first, then notify subscribers over the bus. Command
//! callbacks consult the daemon for a matching permission grant before the
//! user callback runs, consuming the grant in the process.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use mediactl_ipc::{CommandKind, GrantRequest, TableUpdate};
use mediactl_types::{
    Error, Metadata, MetadataAttribute, Playback, PlaybackState, RepeatMode, ServerState,
    ShuffleMode,
};

use crate::bus::{Bus, LocalBus, SignalHandler};
use crate::context::ControllerContext;
use crate::names::{self, Role, UPDATE_INTERFACE};
use crate::registry::ListenerRegistry;
use crate::signal::{SignalName, SignalPayload};
use crate::store::TableStore;

/// Handle owned by the publishing media process.
pub struct MediaServer {
    ctx: Arc<ControllerContext>,
    name: String,
    bus: Arc<LocalBus>,
    registry: ListenerRegistry,
    playback: Mutex<Playback>,
    metadata: Mutex<Metadata>,
}

impl std::fmt::Debug for MediaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaServer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MediaServer {
    /// Create a server handle under the calling process's identity.
    ///
    /// Lazily activates the daemon, announces the connection, claims the
    /// identity in the shared table, and publishes `server_state`
    /// `Activated` on the broadcast interface.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the daemon is unreachable or the identity is
    /// already registered by a live server.
    pub async fn create(ctx: Arc<ControllerContext>) -> Result<Self, Error> {
        let name = names::own_identity()?;
        Self::create_with_identity(ctx, name).await
    }

    /// Create a server handle under an explicit identity.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`MediaServer::create`], plus
    /// `InvalidParameter` on an empty identity.
    pub async fn create_with_identity(
        ctx: Arc<ControllerContext>,
        identity: impl Into<String>,
    ) -> Result<Self, Error> {
        let name = names::sanitize_name(&identity.into());
        if name.is_empty() {
            return Err(Error::InvalidParameter);
        }

        ctx.control().activate().await.map_err(Error::from)?;
        ctx.announce_connect().await?;

        let store = TableStore::open(ctx.table_path().to_path_buf());
        if store.is_registered(&name) {
            warn!(name, "server identity already registered");
            let _ = ctx.announce_disconnect().await;
            return Err(Error::InvalidOperation);
        }

        let bus = ctx.bus().acquire()?;

        // A stale row from an unclean shutdown is replaced wholesale.
        if let Err(e) = ctx
            .db_update(&TableUpdate::RegisterServer { name: name.clone() })
            .await
        {
            let _ = ctx.bus().release();
            let _ = ctx.announce_disconnect().await;
            return Err(e);
        }

        let server = Self {
            ctx,
            name,
            bus,
            registry: ListenerRegistry::new(),
            playback: Mutex::new(Playback::default()),
            metadata: Mutex::new(Metadata::default()),
        };

        if let Err(e) = server.publish_update(
            SignalName::ServerState,
            &SignalPayload::ServerState {
                sender: server.name.clone(),
                state: ServerState::Activated,
            },
        ) {
            warn!(name = server.name, error = %e, "failed to announce activation");
        }

        debug!(name = server.name, "media server created");
        Ok(server)
    }

    /// Identity this server is registered under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage the playback state; nothing is persisted or published until
    /// [`MediaServer::update_playback_info`].
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for a non-commandable state.
    pub fn set_playback_state(&self, state: PlaybackState) -> Result<(), Error> {
        if !state.is_commandable() {
            return Err(Error::InvalidParameter);
        }
        self.lock_playback().state = state;
        Ok(())
    }

    /// Stage the playback position in milliseconds.
    pub fn set_playback_position(&self, position: u64) {
        self.lock_playback().position = position;
    }

    /// Persist the staged playback snapshot and publish it. Entering
    /// `Playing` also moves the latest-server pointer to this server.
    ///
    /// # Errors
    ///
    /// Control-plane and bus failures propagate.
    pub async fn update_playback_info(&self) -> Result<(), Error> {
        let playback = *self.lock_playback();

        self.ctx
            .db_update(&TableUpdate::UpdatePlayback {
                name: self.name.clone(),
                state: playback.state,
                position: playback.position,
            })
            .await?;

        self.publish_update(
            SignalName::Playback,
            &SignalPayload::Playback {
                sender: self.name.clone(),
                state: playback.state,
                position: playback.position,
            },
        )?;

        if playback.state == PlaybackState::Playing {
            self.ctx
                .db_update(&TableUpdate::SetLatest {
                    name: self.name.clone(),
                })
                .await?;
        }

        Ok(())
    }

    /// Stage one metadata field; `None` clears it.
    pub fn set_metadata(&self, attribute: MetadataAttribute, value: Option<&str>) {
        self.lock_metadata()
            .set(attribute, value.map(String::from));
    }

    /// Persist all staged metadata fields and publish the change
    /// notification (readers fetch the row from the table).
    ///
    /// # Errors
    ///
    /// Control-plane and bus failures propagate.
    pub async fn update_metadata(&self) -> Result<(), Error> {
        let metadata = self.lock_metadata().clone();

        self.ctx
            .db_update(&TableUpdate::UpdateMetadata {
                name: self.name.clone(),
                metadata,
            })
            .await?;

        self.publish_update(
            SignalName::Metadata,
            &SignalPayload::Metadata {
                sender: self.name.clone(),
            },
        )
    }

    /// Persist and publish the shuffle mode.
    ///
    /// # Errors
    ///
    /// Control-plane and bus failures propagate.
    pub async fn update_shuffle_mode(&self, mode: ShuffleMode) -> Result<(), Error> {
        self.ctx
            .db_update(&TableUpdate::UpdateShuffle {
                name: self.name.clone(),
                mode,
            })
            .await?;

        self.publish_update(
            SignalName::PlaybackShuffle,
            &SignalPayload::Shuffle {
                sender: self.name.clone(),
                mode,
            },
        )
    }

    /// Persist and publish the repeat mode.
    ///
    /// # Errors
    ///
    /// Control-plane and bus failures propagate.
    pub async fn update_repeat_mode(&self, mode: RepeatMode) -> Result<(), Error> {
        self.ctx
            .db_update(&TableUpdate::UpdateRepeat {
                name: self.name.clone(),
                mode,
            })
            .await?;

        self.publish_update(
            SignalName::PlaybackRepeat,
            &SignalPayload::Repeat {
                sender: self.name.clone(),
                mode,
            },
        )
    }

    /// Listen for playback-state commands on this server's own interface.
    ///
    /// The callback only runs after the daemon confirms (and consumes) the
    /// sender's grant; unauthorized commands are dropped with a warning.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when a command listener is already set.
    pub fn set_playback_command_cb<F>(&self, callback: F) -> Result<(), Error>
    where
        F: Fn(&str, PlaybackState) + Send + Sync + 'static,
    {
        let interface = names::interface_name(Role::Server, &self.name)?;
        let ctx = Arc::clone(&self.ctx);
        let callback = Arc::new(callback);

        let handler: SignalHandler = Arc::new(move |message| {
            let SignalPayload::PlaybackCommand { sender, state } = &message.payload else {
                warn!(signal = %message.signal, "unexpected payload on command interface");
                return;
            };
            let grant = GrantRequest {
                peer: sender.clone(),
                kind: CommandKind::Playback,
                token: None,
            };
            let ctx = Arc::clone(&ctx);
            let callback = Arc::clone(&callback);
            let sender = sender.clone();
            let state = *state;
            tokio::spawn(async move {
                match ctx.check_command(&grant).await {
                    Ok(()) => callback(&sender, state),
                    Err(e) => {
                        warn!(sender, error = %e, "playback command dropped");
                    }
                }
            });
        });

        self.registry.register(
            self.bus.as_ref(),
            &interface,
            SignalName::PlaybackStateCommand,
            handler,
        )
    }

    /// Stop listening for playback-state commands.
    ///
    /// # Errors
    ///
    /// Bus failures propagate; a missing listener is a no-op.
    pub fn unset_playback_command_cb(&self) -> Result<(), Error> {
        let interface = names::interface_name(Role::Server, &self.name)?;
        self.registry
            .unregister(self.bus.as_ref(), &interface, SignalName::PlaybackStateCommand)
    }

    /// Listen for custom commands on this server's own interface, with the
    /// same grant check as playback commands (the grant token is the
    /// command string).
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when a custom-command listener is already set.
    pub fn set_custom_command_cb<F>(&self, callback: F) -> Result<(), Error>
    where
        F: Fn(&str, &str, Option<&Value>) + Send + Sync + 'static,
    {
        let interface = names::interface_name(Role::Server, &self.name)?;
        let ctx = Arc::clone(&self.ctx);
        let callback = Arc::new(callback);

        let handler: SignalHandler = Arc::new(move |message| {
            let SignalPayload::CustomCommand {
                sender,
                command,
                data,
            } = &message.payload
            else {
                warn!(signal = %message.signal, "unexpected payload on command interface");
                return;
            };
            let grant = GrantRequest {
                peer: sender.clone(),
                kind: CommandKind::Custom,
                token: Some(command.clone()),
            };
            let ctx = Arc::clone(&ctx);
            let callback = Arc::clone(&callback);
            let sender = sender.clone();
            let command = command.clone();
            let data = data.clone();
            tokio::spawn(async move {
                match ctx.check_command(&grant).await {
                    Ok(()) => callback(&sender, &command, data.as_ref()),
                    Err(e) => {
                        warn!(sender, command, error = %e, "custom command dropped");
                    }
                }
            });
        });

        self.registry.register(
            self.bus.as_ref(),
            &interface,
            SignalName::CustomCommand,
            handler,
        )
    }

    /// Stop listening for custom commands.
    ///
    /// # Errors
    ///
    /// Bus failures propagate; a missing listener is a no-op.
    pub fn unset_custom_command_cb(&self) -> Result<(), Error> {
        let interface = names::interface_name(Role::Server, &self.name)?;
        self.registry
            .unregister(self.bus.as_ref(), &interface, SignalName::CustomCommand)
    }

    /// Answer a custom command on the client's own interface.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on an empty client name; bus failures propagate.
    pub fn send_command_reply(
        &self,
        client_name: &str,
        result_code: i32,
        data: Option<Value>,
    ) -> Result<(), Error> {
        let interface = names::interface_name(Role::Client, client_name)?;
        self.bus.publish(
            &interface,
            SignalName::CommandReply,
            &SignalPayload::CommandReply {
                sender: self.name.clone(),
                result_code,
                data,
            },
        )
    }

    /// Tear the server down.
    ///
    /// Every cleanup step is attempted even when an earlier one failed; the
    /// last failure is reported. The latest server is soft-deactivated so
    /// late clients still see its last-known values; any other server's row
    /// is deleted outright.
    ///
    /// # Errors
    ///
    /// The last failure observed during teardown, if any.
    pub async fn destroy(self) -> Result<(), Error> {
        let mut last_error = None;

        if let Err(e) = self.registry.unregister_all(self.bus.as_ref()) {
            last_error = Some(e);
        }

        let store = TableStore::open(self.ctx.table_path().to_path_buf());
        let is_latest = store.latest_server_name() == Some(self.name.as_str());

        if let Err(e) = self
            .ctx
            .db_update(&TableUpdate::UnlistServer {
                name: self.name.clone(),
            })
            .await
        {
            last_error = Some(e);
        }

        let row_update = if is_latest {
            TableUpdate::SetServerState {
                name: self.name.clone(),
                state: ServerState::Deactivated,
            }
        } else {
            TableUpdate::RemoveServer {
                name: self.name.clone(),
            }
        };
        if let Err(e) = self.ctx.db_update(&row_update).await {
            last_error = Some(e);
        }

        if let Err(e) = self.publish_update(
            SignalName::ServerState,
            &SignalPayload::ServerState {
                sender: self.name.clone(),
                state: ServerState::Deactivated,
            },
        ) {
            last_error = Some(e);
        }

        if let Err(e) = self.ctx.announce_disconnect().await {
            last_error = Some(e);
        }

        if let Err(e) = self.ctx.bus().release() {
            last_error = Some(e);
        }

        debug!(name = self.name, "media server destroyed");
        last_error.map_or(Ok(()), Err)
    }

    /// Publish an update signal on the broadcast interface and on this
    /// server's scoped interface, so filtered subscribers see it too.
    fn publish_update(&self, signal: SignalName, payload: &SignalPayload) -> Result<(), Error> {
        self.bus.publish(UPDATE_INTERFACE, signal, payload)?;
        let scoped = names::filter_interface_name(UPDATE_INTERFACE, &self.name)?;
        self.bus.publish(&scoped, signal, payload)
    }

    fn lock_playback(&self) -> std::sync::MutexGuard<'_, Playback> {
        self.playback.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_metadata(&self) -> std::sync::MutexGuard<'_, Metadata> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn dead_ctx() -> Arc<ControllerContext> {
        Arc::new(ControllerContext::with_paths(
            PathBuf::from("/nonexistent/mediactl.sock"),
            PathBuf::from("/nonexistent/tables.json"),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_without_daemon_fails() {
        let err = MediaServer::create_with_identity(dead_ctx(), "player")
            .await
            .unwrap_err();
        assert_eq!(err, Error::InvalidOperation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_empty_identity_rejected() {
        let err = MediaServer::create_with_identity(dead_ctx(), "")
            .await
            .unwrap_err();
        assert_eq!(err, Error::InvalidParameter);
    }
}
