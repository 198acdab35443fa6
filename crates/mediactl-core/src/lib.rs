//! Core library for the mediactl control plane.
//!
//! One active media server publishes playback state, metadata, and
//! shuffle/repeat modes; any number of clients subscribe to updates and
//! send commands back. This crate provides the pieces both sides share:
//!
//! - [`names`]: deterministic bus-safe interface naming
//! - [`signal`]: signal names and structured notification payloads
//! - [`bus`]: the pub/sub seam with the ref-counted shared connection
//! - [`registry`]: per-handle listener registry with per-peer filters
//! - [`store`]: the shared table store (daemon-written, handle-read)
//! - [`context`]: the explicitly passed process-wide context
//! - [`server`] / [`client`]: the public handles
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediactl_core::{ControllerContext, MediaClient};
//!
//! # async fn example() -> Result<(), mediactl_types::Error> {
//! let ctx = Arc::new(ControllerContext::new());
//! let client = MediaClient::create(ctx).await?;
//!
//! client.set_playback_update_cb(|server, playback| {
//!     println!("{server}: {:?} @ {}ms", playback.state, playback.position);
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod client;
pub mod context;
pub mod names;
pub mod registry;
pub mod server;
pub mod signal;
pub mod store;

pub use bus::{Bus, BusContext, LocalBus, SignalHandler, SubscriptionId};
pub use client::MediaClient;
pub use context::ControllerContext;
pub use names::{INTERFACE_PREFIX, Role, UPDATE_INTERFACE};
pub use registry::{FilterList, ListenerRegistry};
pub use server::MediaServer;
pub use signal::{SignalMessage, SignalName, SignalPayload};
pub use store::{ServerRecord, TableStore, table_path};

// Re-export the status taxonomy alongside the handles.
pub use mediactl_types::Error;
