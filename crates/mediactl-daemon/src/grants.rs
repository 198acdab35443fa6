//! Command permission grants.
//!
//! A client pre-declares each command it is about to send (CLIENT_SET); the
//! receiving server checks the declaration when the command signal arrives
//! (CLIENT_GET). A grant is consumed by the check that matches it, so one
//! declaration authorizes exactly one command. Grants left behind by a
//! disconnecting process are purged in bulk.

use mediactl_ipc::{CommandKind, GrantRequest};
use tracing::debug;

/// One recorded grant, tagged with the pid that declared it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub pid: i32,
    pub peer: String,
    pub kind: CommandKind,
    pub token: Option<String>,
}

impl Grant {
    fn matches(&self, request: &GrantRequest) -> bool {
        self.peer == request.peer && self.kind == request.kind && self.token == request.token
    }
}

/// In-memory grant list owned by the daemon.
#[derive(Debug, Default)]
pub struct GrantTable {
    entries: Vec<Grant>,
}

impl GrantTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, grant: Grant) {
        debug!(peer = grant.peer, kind = ?grant.kind, "grant recorded");
        self.entries.push(grant);
    }

    /// Consume the first grant matching the request. Returns whether a
    /// match existed; the matched grant is removed either way it is used.
    pub fn consume(&mut self, request: &GrantRequest) -> bool {
        let Some(index) = self.entries.iter().position(|g| g.matches(request)) else {
            return false;
        };
        let grant = self.entries.remove(index);
        debug!(peer = grant.peer, kind = ?grant.kind, "grant consumed");
        true
    }

    /// Drop every grant declared by `pid`. Returns how many were removed.
    pub fn purge_pid(&mut self, pid: i32) -> usize {
        let before = self.entries.len();
        self.entries.retain(|g| g.pid != pid);
        let purged = before - self.entries.len();
        if purged > 0 {
            debug!(pid, purged, "grants purged for disconnected process");
        }
        purged
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
