//! Shared table store.
//!
//! The persistent tables live in one JSON document: a row per registered
//! server, the known-server list, and the singleton latest-server pointer.
//! The daemon is the only writer; it applies [`TableUpdate`] mutations and
//! saves after each one. Handles open the same path read-only and reload
//! before each query, tolerating the eventual consistency of the async
//! update path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mediactl_ipc::TableUpdate;
use mediactl_types::{
    Error, Metadata, Playback, RepeatMode, ServerState, ShuffleMode,
};

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(|_| std::env::temp_dir(), PathBuf::from)
}

/// Well-known path of the shared table file.
#[must_use]
pub fn table_path() -> PathBuf {
    runtime_dir().join("mediactl-tables.json")
}

/// One row of the server table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub state: ServerState,
    pub playback: Playback,
    pub metadata: Metadata,
    pub shuffle: ShuffleMode,
    pub repeat: RepeatMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    servers: BTreeMap<String, ServerRecord>,
    server_list: Vec<String>,
    latest: Option<String>,
}

/// The store: tables plus the file they persist to.
pub struct TableStore {
    path: PathBuf,
    tables: Tables,
}

impl TableStore {
    /// Open the store, loading the file when present. A missing or
    /// unparseable file yields empty tables (the writer will recreate it).
    #[must_use]
    pub fn open(path: PathBuf) -> Self {
        let tables = Self::load(&path);
        Self { path, tables }
    }

    fn load(path: &Path) -> Tables {
        let Ok(content) = std::fs::read_to_string(path) else {
            debug!(path = %path.display(), "table file not found, starting empty");
            return Tables::default();
        };
        match serde_json::from_str(&content) {
            Ok(tables) => tables,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to parse table file");
                Tables::default()
            }
        }
    }

    /// Re-read the file, picking up the writer's latest state.
    pub fn reload(&mut self) {
        self.tables = Self::load(&self.path);
    }

    /// Drop and recreate all tables, persisting the empty state. Called by
    /// the daemon while starting.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the file cannot be written.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.tables = Tables::default();
        self.save()
    }

    fn save(&self) -> Result<(), Error> {
        let content =
            serde_json::to_string(&self.tables).map_err(|_| Error::InvalidOperation)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|_| Error::InvalidOperation)?;
        }
        std::fs::write(&self.path, content).map_err(|_| Error::InvalidOperation)
    }

    /// Apply one mutation and persist.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` when the update addresses an unknown server;
    /// `InvalidOperation` when persisting fails.
    pub fn apply(&mut self, update: &TableUpdate) -> Result<(), Error> {
        match update {
            TableUpdate::RegisterServer { name } => {
                self.tables.servers.insert(
                    name.clone(),
                    ServerRecord {
                        state: ServerState::Activated,
                        ..ServerRecord::default()
                    },
                );
                if !self.tables.server_list.contains(name) {
                    self.tables.server_list.push(name.clone());
                }
            }
            TableUpdate::SetServerState { name, state } => {
                self.record_mut(name)?.state = *state;
            }
            TableUpdate::UpdatePlayback {
                name,
                state,
                position,
            } => {
                let record = self.record_mut(name)?;
                record.playback = Playback {
                    state: *state,
                    position: *position,
                };
            }
            TableUpdate::UpdateMetadata { name, metadata } => {
                self.record_mut(name)?.metadata = metadata.clone();
            }
            TableUpdate::UpdateShuffle { name, mode } => {
                self.record_mut(name)?.shuffle = *mode;
            }
            TableUpdate::UpdateRepeat { name, mode } => {
                self.record_mut(name)?.repeat = *mode;
            }
            TableUpdate::SetLatest { name } => {
                // Singleton: the previous pointer is replaced wholesale.
                self.tables.latest = Some(name.clone());
            }
            TableUpdate::UnlistServer { name } => {
                self.tables.server_list.retain(|n| n != name);
            }
            TableUpdate::RemoveServer { name } => {
                self.tables.servers.remove(name);
                self.tables.server_list.retain(|n| n != name);
            }
        }
        self.save()
    }

    fn record_mut(&mut self, name: &str) -> Result<&mut ServerRecord, Error> {
        self.tables
            .servers
            .get_mut(name)
            .ok_or(Error::InvalidParameter)
    }

    /// Name in the latest-server pointer, if any.
    #[must_use]
    pub fn latest_server_name(&self) -> Option<&str> {
        self.tables.latest.as_deref()
    }

    #[must_use]
    pub fn server_state(&self, name: &str) -> Option<ServerState> {
        self.tables.servers.get(name).map(|r| r.state)
    }

    #[must_use]
    pub fn playback(&self, name: &str) -> Option<Playback> {
        self.tables.servers.get(name).map(|r| r.playback)
    }

    #[must_use]
    pub fn metadata(&self, name: &str) -> Option<Metadata> {
        self.tables.servers.get(name).map(|r| r.metadata.clone())
    }

    #[must_use]
    pub fn shuffle_mode(&self, name: &str) -> Option<ShuffleMode> {
        self.tables.servers.get(name).map(|r| r.shuffle)
    }

    #[must_use]
    pub fn repeat_mode(&self, name: &str) -> Option<RepeatMode> {
        self.tables.servers.get(name).map(|r| r.repeat)
    }

    /// Registered server names, in registration order.
    #[must_use]
    pub fn server_names(&self) -> &[String] {
        &self.tables.server_list
    }

    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.tables.server_list.iter().any(|n| n == name)
    }
}
