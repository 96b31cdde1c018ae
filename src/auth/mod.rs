//! Control channel authentication
//!
//! - [`Password`]: the shared secret, compared in constant time
//! - [`Handshake`]: per-connection state machine run before a session is
//!   admitted

mod handshake;
mod password;

pub use handshake::{AuthFailure, AuthState, Handshake, HandshakeAction, HandshakeInput};
pub use password::Password;
