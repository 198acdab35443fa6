//! Mediactl daemon library: the privileged arbiter owning the shared
//! table, command permission grants, and the connection-count lifecycle.

pub mod authorize;
pub mod error;
pub mod grants;
pub mod service;

pub use authorize::{AllowAll, Authorizer, DenyAll, PeerCredentials, Privilege};
pub use error::{DaemonError, Result};
pub use grants::{Grant, GrantTable};
pub use service::{DaemonConfig, DaemonState, IDLE_PERIOD, ServiceState, run};
