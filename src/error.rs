//! Error types for the monitor

use crate::auth::AuthFailure;
use crate::hub::HubError;
use thiserror::Error;

/// Errors raised by the monitoring layer
///
/// None of these ever reach callers of the instrumented hub. Capture-side
/// failures are logged and swallowed; everything else surfaces either from
/// [`Monitor::attach`](crate::Monitor::attach) or through the configured
/// `on_error` callback.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The control channel could not bind its listening socket
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Transport-level I/O failure on an established connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be read or written by the line codec
    #[error("codec error: {0}")]
    Codec(String),

    /// A message body could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The hub collaborator failed a read needed for a snapshot
    #[error("hub error: {0}")]
    Hub(#[from] HubError),

    /// The peer sent something the protocol does not allow
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer failed the authentication handshake
    #[error("authentication failed: {0}")]
    Auth(AuthFailure),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The connection is closed
    #[error("connection closed")]
    Closed,
}

impl MonitorError {
    /// Auth rejections and clean closes are part of normal operation and are
    /// not forwarded to `on_error`.
    pub fn is_expected(&self) -> bool {
        matches!(self, MonitorError::Auth(_) | MonitorError::Closed)
    }
}
