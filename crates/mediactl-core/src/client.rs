//! Media client handle.
//!
//! Subscribes to server updates on the broadcast interface, optionally
//! narrowed to single servers through filtered listeners, reads last-known
//! state from the shared table, and sends commands back after pre-declaring
//! them with the daemon.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use mediactl_ipc::{CommandKind, GrantRequest};
use mediactl_types::{
    Error, Metadata, Playback, PlaybackState, RepeatMode, ServerState, ShuffleMode,
    SubscriptionType,
};

use crate::bus::{Bus, LocalBus, SignalHandler};
use crate::context::ControllerContext;
use crate::names::{self, Role, UPDATE_INTERFACE};
use crate::registry::{FilterList, ListenerRegistry};
use crate::signal::{SignalName, SignalPayload};
use crate::store::TableStore;

fn signal_for(topic: SubscriptionType) -> SignalName {
    match topic {
        SubscriptionType::ServerState => SignalName::ServerState,
        SubscriptionType::Playback => SignalName::Playback,
        SubscriptionType::Metadata => SignalName::Metadata,
        SubscriptionType::ShuffleMode => SignalName::PlaybackShuffle,
        SubscriptionType::RepeatMode => SignalName::PlaybackRepeat,
    }
}

struct TopicReceiver {
    handler: SignalHandler,
    filters: FilterList,
}

/// Handle owned by a subscribing process.
pub struct MediaClient {
    ctx: Arc<ControllerContext>,
    name: String,
    bus: Arc<LocalBus>,
    registry: ListenerRegistry,
    store: Arc<Mutex<TableStore>>,
    receivers: Mutex<HashMap<SubscriptionType, TopicReceiver>>,
}

impl std::fmt::Debug for MediaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaClient")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MediaClient {
    /// Create a client handle under the calling process's identity.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the daemon is unreachable.
    pub async fn create(ctx: Arc<ControllerContext>) -> Result<Self, Error> {
        let name = names::own_identity()?;
        Self::create_with_identity(ctx, name).await
    }

    /// Create a client handle under an explicit identity.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`MediaClient::create`], plus
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

        let bus = match ctx.bus().acquire() {
            Ok(bus) => bus,
            Err(e) => {
                let _ = ctx.announce_disconnect().await;
                return Err(e);
            }
        };

        let store = Arc::new(Mutex::new(TableStore::open(ctx.table_path().to_path_buf())));

        debug!(name, "media client created");
        Ok(Self {
            ctx,
            name,
            bus,
            registry: ListenerRegistry::new(),
            store,
            receivers: Mutex::new(HashMap::new()),
        })
    }

    /// Identity this client sends commands under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive `server_state` updates from every server.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when a callback for the topic is already set.
    pub fn set_server_state_update_cb<F>(&self, callback: F) -> Result<(), Error>
    where
        F: Fn(&str, ServerState) + Send + Sync + 'static,
    {
        let handler: SignalHandler = Arc::new(move |message| {
            if let SignalPayload::ServerState { sender, state } = &message.payload {
                callback(sender, *state);
            }
        });
        self.set_update_cb(SubscriptionType::ServerState, handler)
    }

    /// Stop receiving `server_state` updates.
    ///
    /// # Errors
    ///
    /// Bus failures propagate.
    pub fn unset_server_state_update_cb(&self) -> Result<(), Error> {
        self.unset_update_cb(SubscriptionType::ServerState)
    }

    /// Receive `playback` updates from every server.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when a callback for the topic is already set.
    pub fn set_playback_update_cb<F>(&self, callback: F) -> Result<(), Error>
    where
        F: Fn(&str, Playback) + Send + Sync + 'static,
    {
        let handler: SignalHandler = Arc::new(move |message| {
            if let SignalPayload::Playback {
                sender,
                state,
                position,
            } = &message.payload
            {
                callback(
                    sender,
                    Playback {
                        state: *state,
                        position: *position,
                    },
                );
            }
        });
        self.set_update_cb(SubscriptionType::Playback, handler)
    }

    /// Stop receiving `playback` updates.
    ///
    /// # Errors
    ///
    /// Bus failures propagate.
    pub fn unset_playback_update_cb(&self) -> Result<(), Error> {
        self.unset_update_cb(SubscriptionType::Playback)
    }

    /// Receive `metadata` updates. The callback gets the full row as read
    /// back from the shared table at delivery time.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when a callback for the topic is already set.
    pub fn set_metadata_update_cb<F>(&self, callback: F) -> Result<(), Error>
    where
        F: Fn(&str, Metadata) + Send + Sync + 'static,
    {
        let store = Arc::clone(&self.store);
        let handler: SignalHandler = Arc::new(move |message| {
            if let SignalPayload::Metadata { sender } = &message.payload {
                let metadata = {
                    let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
                    store.reload();
                    store.metadata(sender)
                };
                match metadata {
                    Some(metadata) => callback(sender, metadata),
                    None => {
                        warn!(sender, "metadata update for unknown server");
                        callback(sender, Metadata::default());
                    }
                }
            }
        });
        self.set_update_cb(SubscriptionType::Metadata, handler)
    }

    /// Stop receiving `metadata` updates.
    ///
    /// # Errors
    ///
    /// Bus failures propagate.
    pub fn unset_metadata_update_cb(&self) -> Result<(), Error> {
        self.unset_update_cb(SubscriptionType::Metadata)
    }

    /// Receive `playback_shuffle` updates.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when a callback for the topic is already set.
    pub fn set_shuffle_mode_update_cb<F>(&self, callback: F) -> Result<(), Error>
    where
        F: Fn(&str, ShuffleMode) + Send + Sync + 'static,
    {
        let handler: SignalHandler = Arc::new(move |message| {
            if let SignalPayload::Shuffle { sender, mode } = &message.payload {
                callback(sender, *mode);
            }
        });
        self.set_update_cb(SubscriptionType::ShuffleMode, handler)
    }

    /// Stop receiving `playback_shuffle` updates.
    ///
    /// # Errors
    ///
    /// Bus failures propagate.
    pub fn unset_shuffle_mode_update_cb(&self) -> Result<(), Error> {
        self.unset_update_cb(SubscriptionType::ShuffleMode)
    }

    /// Receive `playback_repeat` updates.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when a callback for the topic is already set.
    pub fn set_repeat_mode_update_cb<F>(&self, callback: F) -> Result<(), Error>
    where
        F: Fn(&str, RepeatMode) + Send + Sync + 'static,
    {
        let handler: SignalHandler = Arc::new(move |message| {
            if let SignalPayload::Repeat { sender, mode } = &message.payload {
                callback(sender, *mode);
            }
        });
        self.set_update_cb(SubscriptionType::RepeatMode, handler)
    }

    /// Stop receiving `playback_repeat` updates.
    ///
    /// # Errors
    ///
    /// Bus failures propagate.
    pub fn unset_repeat_mode_update_cb(&self) -> Result<(), Error> {
        self.unset_update_cb(SubscriptionType::RepeatMode)
    }

    /// Narrow a topic to one server. The broadcast listener for the topic
    /// is replaced by per-server listeners; further `subscribe` calls add
    /// more servers.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when no callback is set for the topic or the
    /// server name is empty.
    pub fn subscribe(&self, topic: SubscriptionType, server_name: &str) -> Result<(), Error> {
        if server_name.is_empty() {
            return Err(Error::InvalidParameter);
        }

        let mut receivers = self.lock_receivers();
        let receiver = receivers.get_mut(&topic).ok_or(Error::InvalidParameter)?;

        self.registry
            .unregister(self.bus.as_ref(), UPDATE_INTERFACE, signal_for(topic))?;

        let handler = Arc::clone(&receiver.handler);
        self.registry.register_filtered(
            self.bus.as_ref(),
            &mut receiver.filters,
            UPDATE_INTERFACE,
            server_name,
            signal_for(topic),
            handler,
        )
    }

    /// Undo [`MediaClient::subscribe`] for one server. Removing the last
    /// filter restores broadcast delivery for the topic.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when no callback is set for the topic.
    pub fn unsubscribe(&self, topic: SubscriptionType, server_name: &str) -> Result<(), Error> {
        let mut receivers = self.lock_receivers();
        let receiver = receivers.get_mut(&topic).ok_or(Error::InvalidParameter)?;

        self.registry.unregister_filtered(
            self.bus.as_ref(),
            &mut receiver.filters,
            UPDATE_INTERFACE,
            Some(server_name),
            signal_for(topic),
        )?;

        if receiver.filters.is_empty() {
            let handler = Arc::clone(&receiver.handler);
            self.registry.register(
                self.bus.as_ref(),
                UPDATE_INTERFACE,
                signal_for(topic),
                handler,
            )?;
        }
        Ok(())
    }

    /// Visit each server the topic is narrowed to, in subscription order;
    /// the callback returning `false` stops early.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when no callback is set for the topic.
    pub fn foreach_server_subscribed(
        &self,
        topic: SubscriptionType,
        callback: impl FnMut(&str) -> bool,
    ) -> Result<(), Error> {
        let receivers = self.lock_receivers();
        let receiver = receivers.get(&topic).ok_or(Error::InvalidParameter)?;
        receiver.filters.foreach_peer(UPDATE_INTERFACE, callback);
        Ok(())
    }

    /// Name and state of the most recently playing server, or
    /// `(None, ServerState::None)` when the pointer is empty.
    #[must_use]
    pub fn latest_server_info(&self) -> (Option<String>, ServerState) {
        let mut store = self.lock_store();
        store.reload();
        match store.latest_server_name() {
            Some(name) => {
                let state = store.server_state(name).unwrap_or(ServerState::None);
                (Some(name.to_string()), state)
            }
            None => (None, ServerState::None),
        }
    }

    /// Last-known playback snapshot of a server.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for an unknown server.
    pub fn server_playback_info(&self, server_name: &str) -> Result<Playback, Error> {
        let mut store = self.lock_store();
        store.reload();
        store.playback(server_name).ok_or(Error::InvalidParameter)
    }

    /// Last-known metadata of a server.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for an unknown server.
    pub fn server_metadata(&self, server_name: &str) -> Result<Metadata, Error> {
        let mut store = self.lock_store();
        store.reload();
        store.metadata(server_name).ok_or(Error::InvalidParameter)
    }

    /// Last-known shuffle mode of a server.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for an unknown server.
    pub fn server_shuffle_mode(&self, server_name: &str) -> Result<ShuffleMode, Error> {
        let mut store = self.lock_store();
        store.reload();
        store
            .shuffle_mode(server_name)
            .ok_or(Error::InvalidParameter)
    }

    /// Last-known repeat mode of a server.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` for an unknown server.
    pub fn server_repeat_mode(&self, server_name: &str) -> Result<RepeatMode, Error> {
        let mut store = self.lock_store();
        store.reload();
        store
            .repeat_mode(server_name)
            .ok_or(Error::InvalidParameter)
    }

    /// Visit every registered server, in registration order; the callback
    /// returning `false` stops early.
    pub fn foreach_server(&self, mut callback: impl FnMut(&str) -> bool) {
        let mut store = self.lock_store();
        store.reload();
        for name in store.server_names() {
            if !callback(name) {
                break;
            }
        }
    }

    /// Send a playback-state command to a server, pre-declaring it with the
    /// daemon so the server's grant check passes exactly once.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on a bad server name or non-commandable state;
    /// control-plane and bus failures propagate.
    pub async fn send_playback_state_command(
        &self,
        server_name: &str,
        state: PlaybackState,
    ) -> Result<(), Error> {
        if server_name.is_empty() || !state.is_commandable() {
            return Err(Error::InvalidParameter);
        }

        self.ctx
            .declare_command(&GrantRequest {
                peer: self.name.clone(),
                kind: CommandKind::Playback,
                token: None,
            })
            .await?;

        let interface = names::interface_name(Role::Server, server_name)?;
        self.bus.publish(
            &interface,
            SignalName::PlaybackStateCommand,
            &SignalPayload::PlaybackCommand {
                sender: self.name.clone(),
                state,
            },
        )
    }

    /// Send a custom command to a server; the command string doubles as the
    /// grant token. Replies arrive on the listener installed with
    /// [`MediaClient::set_command_reply_cb`].
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on empty names; control-plane and bus failures
    /// propagate.
    pub async fn send_custom_command(
        &self,
        server_name: &str,
        command: &str,
        data: Option<Value>,
    ) -> Result<(), Error> {
        if server_name.is_empty() || command.is_empty() {
            return Err(Error::InvalidParameter);
        }

        self.ctx
            .declare_command(&GrantRequest {
                peer: self.name.clone(),
                kind: CommandKind::Custom,
                token: Some(command.to_string()),
            })
            .await?;

        let interface = names::interface_name(Role::Server, server_name)?;
        self.bus.publish(
            &interface,
            SignalName::CustomCommand,
            &SignalPayload::CustomCommand {
                sender: self.name.clone(),
                command: command.to_string(),
                data,
            },
        )
    }

    /// Receive `command_reply` signals on this client's own interface.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when a reply listener is already set.
    pub fn set_command_reply_cb<F>(&self, callback: F) -> Result<(), Error>
    where
        F: Fn(&str, i32, Option<&Value>) + Send + Sync + 'static,
    {
        let interface = names::interface_name(Role::Client, &self.name)?;
        let handler: SignalHandler = Arc::new(move |message| {
            if let SignalPayload::CommandReply {
                sender,
                result_code,
                data,
            } = &message.payload
            {
                callback(sender, *result_code, data.as_ref());
            }
        });
        self.registry.register(
            self.bus.as_ref(),
            &interface,
            SignalName::CommandReply,
            handler,
        )
    }

    /// Stop receiving `command_reply` signals.
    ///
    /// # Errors
    ///
    /// Bus failures propagate; a missing listener is a no-op.
    pub fn unset_command_reply_cb(&self) -> Result<(), Error> {
        let interface = names::interface_name(Role::Client, &self.name)?;
        self.registry
            .unregister(self.bus.as_ref(), &interface, SignalName::CommandReply)
    }

    /// Tear the client down, attempting every cleanup step and reporting
    /// the last failure.
    ///
    /// # Errors
    ///
    /// The last failure observed during teardown, if any.
    pub async fn destroy(self) -> Result<(), Error> {
        let mut last_error = None;

        if let Err(e) = self.registry.unregister_all(self.bus.as_ref()) {
            last_error = Some(e);
        }
        self.lock_receivers().clear();

        if let Err(e) = self.ctx.announce_disconnect().await {
            last_error = Some(e);
        }

        if let Err(e) = self.ctx.bus().release() {
            last_error = Some(e);
        }

        debug!(name = self.name, "media client destroyed");
        last_error.map_or(Ok(()), Err)
    }

    fn set_update_cb(&self, topic: SubscriptionType, handler: SignalHandler) -> Result<(), Error> {
        self.registry.register(
            self.bus.as_ref(),
            UPDATE_INTERFACE,
            signal_for(topic),
            Arc::clone(&handler),
        )?;
        self.lock_receivers().insert(
            topic,
            TopicReceiver {
                handler,
                filters: FilterList::new(),
            },
        );
        Ok(())
    }

    fn unset_update_cb(&self, topic: SubscriptionType) -> Result<(), Error> {
        let receiver = self.lock_receivers().remove(&topic);
        let Some(mut receiver) = receiver else {
            return Ok(());
        };

        let mut last_error = None;
        if let Err(e) =
            self.registry
                .unregister(self.bus.as_ref(), UPDATE_INTERFACE, signal_for(topic))
        {
            last_error = Some(e);
        }
        if let Err(e) = self.registry.unregister_filtered(
            self.bus.as_ref(),
            &mut receiver.filters,
            UPDATE_INTERFACE,
            None,
            signal_for(topic),
        ) {
            last_error = Some(e);
        }
        last_error.map_or(Ok(()), Err)
    }

    fn lock_receivers(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SubscriptionType, TopicReceiver>> {
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_store(&self) -> std::sync::MutexGuard<'_, TableStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
