//! Authorized monitor sessions

use crate::server::wire::WireMessage;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use uuid::Uuid;

/// Outbound messages buffered per session before fan-out starts dropping
pub const SESSION_QUEUE_CAPACITY: usize = 1024;

/// A monitor client that passed the handshake
///
/// Dropping every clone of the session's sender closes its outbound queue,
/// which in turn ends the connection's relay loop.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    peer: String,
    tx: mpsc::Sender<WireMessage>,
}

impl Session {
    pub fn new(peer: impl Into<String>, tx: mpsc::Sender<WireMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer: peer.into(),
            tx,
        }
    }

    /// A session together with the receiving end of its queue
    pub fn channel(peer: impl Into<String>) -> (Self, mpsc::Receiver<WireMessage>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        (Self::new(peer, tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue without waiting; fails when the queue is full or closed
    pub fn try_send(&self, msg: WireMessage) -> Result<(), TrySendError<WireMessage>> {
        self.tx.try_send(msg)
    }

    pub async fn send(&self, msg: WireMessage) -> Result<(), SendError<WireMessage>> {
        self.tx.send(msg).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
