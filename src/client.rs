//! Monitor client
//!
//! Connects to a monitor, answers the auth handshake, and yields the `init`
//! snapshot followed by the live event stream.
//!
//! ```no_run
//! use hubmon::client::MonitorClient;
//!
//! # async fn run() -> Result<(), hubmon::client::ClientError> {
//! let mut client = MonitorClient::connect("127.0.0.1:9042", Some("secret")).await?;
//! let snapshot = client.next_init().await?;
//! println!("{} sockets online", snapshot.sockets.len());
//!
//! while let Some(event) = client.next_event().await? {
//!     println!("{}: {:?}", event.kind(), event);
//! }
//! # Ok(())
//! # }
//! ```

use crate::auth::AuthFailure;
use crate::error::MonitorError;
use crate::events::{CanonicalEvent, EventKind};
use crate::server::wire::{JsonLinesSession, WireMessage, WireSession};
use crate::snapshot::StateSnapshot;
use std::time::Duration;
use thiserror::Error;
use tokio::net::ToSocketAddrs;
use tokio::time::timeout;
use tracing::debug;

/// How long the client waits for each handshake step
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    /// The monitor refused the password or timed us out
    #[error("Unauthorized: {0}")]
    Unauthorized(AuthFailure),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The monitor reported a failure, e.g. while building the snapshot
    #[error("Server error: {0}")]
    Server(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    Closed,
}

impl From<MonitorError> for ClientError {
    fn from(e: MonitorError) -> Self {
        match e {
            MonitorError::Closed => ClientError::Closed,
            MonitorError::Serialization(e) => ClientError::Serialization(e),
            other => ClientError::Connection(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// A decoded server message
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorMessage {
    Init(StateSnapshot),
    Event(CanonicalEvent),
    Error(String),
    /// Anything this client does not understand
    Other(WireMessage),
}

impl MonitorMessage {
    pub fn decode(msg: WireMessage) -> Result<Self> {
        if msg.name == "init" {
            return Ok(MonitorMessage::Init(serde_json::from_value(msg.data)?));
        }
        if msg.name == "error" {
            let message = msg.data["message"].as_str().unwrap_or_default().to_string();
            return Ok(MonitorMessage::Error(message));
        }
        match EventKind::parse(&msg.name) {
            Some(kind) => Ok(MonitorMessage::Event(CanonicalEvent::from_wire(kind, msg.data)?)),
            None => Ok(MonitorMessage::Other(msg)),
        }
    }
}

/// An authorized connection to a monitor
pub struct MonitorClient<W: WireSession = JsonLinesSession> {
    wire: W,
}

impl MonitorClient<JsonLinesSession> {
    /// Connect over TCP and authenticate
    pub async fn connect(addr: impl ToSocketAddrs, password: Option<&str>) -> Result<Self> {
        let wire = JsonLinesSession::connect(addr)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        Self::handshake(wire, password).await
    }
}

impl<W: WireSession> MonitorClient<W> {
    /// Authenticate over an already open session
    pub async fn handshake(mut wire: W, password: Option<&str>) -> Result<Self> {
        let required = loop {
            let msg = recv_within(&mut wire, HANDSHAKE_TIMEOUT).await?;
            if msg.name == "reqAuth" {
                break msg.data.as_bool().unwrap_or(false);
            }
            debug!(name = %msg.name, "Skipping message before reqAuth");
        };

        wire.send(WireMessage::password(password.unwrap_or_default()))
            .await?;

        if required {
            let msg = recv_within(&mut wire, HANDSHAKE_TIMEOUT).await?;
            if msg.name != "auth" {
                return Err(ClientError::Protocol(format!(
                    "expected auth, got {}",
                    msg.name
                )));
            }
            if msg.data["authorized"].as_bool() != Some(true) {
                let code = msg.data["error"].as_str().unwrap_or_default();
                let failure = AuthFailure::from_code(code).ok_or_else(|| {
                    ClientError::Protocol(format!("unknown auth error {:?}", code))
                })?;
                wire.close().await;
                return Err(ClientError::Unauthorized(failure));
            }
        }

        Ok(Self { wire })
    }

    /// Next raw message; `None` once the monitor closes the connection
    pub async fn next_message(&mut self) -> Result<Option<WireMessage>> {
        match self.wire.recv().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Next decoded message
    pub async fn next_decoded(&mut self) -> Result<Option<MonitorMessage>> {
        match self.next_message().await? {
            Some(msg) => MonitorMessage::decode(msg).map(Some),
            None => Ok(None),
        }
    }

    /// Wait for the `init` snapshot, skipping anything sent before it
    pub async fn next_init(&mut self) -> Result<StateSnapshot> {
        loop {
            match self.next_decoded().await? {
                Some(MonitorMessage::Init(snapshot)) => return Ok(snapshot),
                Some(MonitorMessage::Error(message)) => return Err(ClientError::Server(message)),
                Some(_) => continue,
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Next canonical event, skipping everything else
    pub async fn next_event(&mut self) -> Result<Option<CanonicalEvent>> {
        loop {
            match self.next_decoded().await? {
                Some(MonitorMessage::Event(event)) => return Ok(Some(event)),
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    pub async fn close(mut self) {
        self.wire.close().await;
    }
}

async fn recv_within<W: WireSession>(wire: &mut W, limit: Duration) -> Result<WireMessage> {
    match timeout(limit, wire.recv()).await {
        Err(_) => Err(ClientError::Timeout),
        Ok(None) => Err(ClientError::Closed),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(Some(Ok(msg))) => Ok(msg),
    }
}
