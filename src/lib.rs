//! hubmon - live monitoring feed for a real-time pub/sub hub
//!
//! Wraps a hub's membership store and connections so that every connect,
//! join, leave, broadcast and message is captured as a canonical event, then
//! streams those events over a password-protected TCP control channel to any
//! number of monitor clients. Each client first receives an `init` snapshot
//! of the hub's current rooms and sockets.
//!
//! ```no_run
//! use hubmon::hub::memory::MemoryAdapter;
//! use hubmon::hub::Adapter;
//! use hubmon::{Monitor, MonitorConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), hubmon::MonitorError> {
//! let hub = Arc::new(MemoryAdapter::new());
//! let monitor = Monitor::attach(hub.clone(), MonitorConfig::new().password("secret")).await?;
//!
//! // Route the hub through the instrumented adapter
//! let conn = monitor.on_connection(hub.connect("s1"));
//! monitor.adapter().add("s1", "lobby")?;
//! # drop(conn);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod events;
pub mod hub;
pub mod intercept;
pub mod monitor;
pub mod server;
pub mod snapshot;

pub use auth::{AuthFailure, Password};
pub use client::{ClientError, MonitorClient};
pub use error::MonitorError;
pub use events::{CanonicalEvent, EventHub, EventKind, SubscriptionId};
pub use hub::{Adapter, Connection, HubError, MembershipView};
pub use intercept::{MonitoredAdapter, MonitoredConnection};
pub use monitor::{ErrorCallback, Monitor, MonitorConfig};
pub use server::{ClientAttached, WireMessage};
pub use snapshot::{compute_snapshot, RoomState, StateSnapshot};
