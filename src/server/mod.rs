//! Monitor control channel
//!
//! Accepts TCP clients, authenticates them, and streams canonical events to
//! every authorized session.

pub mod listener;
pub mod roster;
pub mod session;
pub mod wire;

pub use listener::{listen, serve_connection, ClientAttached, ListenerContext, ListenerHandle};
pub use roster::{Dispatcher, Roster};
pub use session::{Session, SESSION_QUEUE_CAPACITY};
pub use wire::{ChannelSession, JsonLinesSession, WireMessage, WireSession, MAX_LINE_LENGTH};
