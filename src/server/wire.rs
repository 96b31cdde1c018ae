//! Control channel framing
//!
//! Every message is a `{"name": ..., "data": ...}` object. Over TCP each
//! object occupies one line.

use crate::auth::AuthFailure;
use crate::error::MonitorError;
use crate::events::CanonicalEvent;
use crate::snapshot::StateSnapshot;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

/// Longest accepted line, in bytes
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// One named message on the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl WireMessage {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Opens the handshake; `required` tells the peer whether a secret is checked
    pub fn req_auth(required: bool) -> Self {
        Self::new("reqAuth", Value::Bool(required))
    }

    pub fn auth_ok() -> Self {
        Self::new("auth", json!({ "authorized": true }))
    }

    pub fn auth_failed(failure: AuthFailure) -> Self {
        Self::new(
            "auth",
            json!({ "authorized": false, "error": failure.code() }),
        )
    }

    pub fn init(snapshot: &StateSnapshot) -> Result<Self, MonitorError> {
        Ok(Self::new("init", serde_json::to_value(snapshot)?))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", json!({ "message": message.into() }))
    }

    pub fn password(secret: impl Into<String>) -> Self {
        Self::new("password", Value::String(secret.into()))
    }

    /// Canonical event, named after its kind
    pub fn event(event: &CanonicalEvent) -> Result<Self, MonitorError> {
        Ok(Self::new(event.kind().as_str(), event.payload()?))
    }
}

/// A bidirectional message stream to one peer
#[async_trait]
pub trait WireSession: Send {
    /// Human readable peer label for logs
    fn peer(&self) -> String;

    async fn send(&mut self, msg: WireMessage) -> Result<(), MonitorError>;

    /// Next inbound message, or `None` once the peer is gone
    async fn recv(&mut self) -> Option<Result<WireMessage, MonitorError>>;

    async fn close(&mut self);
}

/// Newline-delimited JSON over TCP
pub struct JsonLinesSession {
    framed: Framed<TcpStream, LinesCodec>,
    peer: String,
}

impl JsonLinesSession {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            peer,
        }
    }

    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, MonitorError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl WireSession for JsonLinesSession {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    async fn send(&mut self, msg: WireMessage) -> Result<(), MonitorError> {
        let line = serde_json::to_string(&msg)?;
        self.framed
            .send(line)
            .await
            .map_err(|e| MonitorError::Codec(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<WireMessage, MonitorError>> {
        loop {
            let line = match self.framed.next().await? {
                Ok(line) => line,
                Err(e) => return Some(Err(MonitorError::Codec(e.to_string()))),
            };

            // Blank lines are keepalives
            if line.trim().is_empty() {
                continue;
            }

            return Some(serde_json::from_str(&line).map_err(MonitorError::from));
        }
    }

    async fn close(&mut self) {
        let _ = SinkExt::<String>::close(&mut self.framed).await;
    }
}

/// In-process session pair, used to drive the listener without sockets
pub struct ChannelSession {
    tx: Option<mpsc::UnboundedSender<WireMessage>>,
    rx: mpsc::UnboundedReceiver<WireMessage>,
    peer: String,
}

impl ChannelSession {
    /// Two ends wired to each other
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        let a = Self {
            tx: Some(a_tx),
            rx: b_rx,
            peer: "channel:a".to_string(),
        };
        let b = Self {
            tx: Some(b_tx),
            rx: a_rx,
            peer: "channel:b".to_string(),
        };
        (a, b)
    }
}

#[async_trait]
impl WireSession for ChannelSession {
    fn peer(&self) -> String {
        self.peer.clone()
    }

    async fn send(&mut self, msg: WireMessage) -> Result<(), MonitorError> {
        match &self.tx {
            Some(tx) => tx.send(msg).map_err(|_| MonitorError::Closed),
            None => Err(MonitorError::Closed),
        }
    }

    async fn recv(&mut self) -> Option<Result<WireMessage, MonitorError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}
