//! Canonical event vocabulary and the per-hub event publisher
//!
//! Every intercepted hub operation becomes one [`CanonicalEvent`]. The
//! [`EventHub`] hands it synchronously to the handlers subscribed to its
//! kind. There is no buffering: an event published with no subscriber for
//! its kind is dropped.

use crate::error::MonitorError;
use crate::hub::{MembershipView, RoomName, SocketId};
use crate::snapshot::{compute_snapshot, StateSnapshot};
use parking_lot::{ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Kinds of canonical events; the wire name doubles as the message name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Connect,
    Disconnect,
    Join,
    Leave,
    LeaveAll,
    Broadcast,
    Emit,
    Recv,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Join,
        EventKind::Leave,
        EventKind::LeaveAll,
        EventKind::Broadcast,
        EventKind::Emit,
        EventKind::Recv,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Join => "join",
            EventKind::Leave => "leave",
            EventKind::LeaveAll => "leaveAll",
            EventKind::Broadcast => "broadcast",
            EventKind::Emit => "emit",
            EventKind::Recv => "recv",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub id: SocketId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub id: SocketId,
    pub room: RoomName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub name: String,
    pub args: Vec<Value>,
    pub rooms: Vec<RoomName>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: SocketId,
    pub name: String,
    pub args: Vec<Value>,
}

/// A hub operation, normalized
///
/// Serializes as its bare payload; the kind travels separately as the
/// message name (see [`CanonicalEvent::from_wire`]).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CanonicalEvent {
    Connect(ConnectionEvent),
    Disconnect(ConnectionEvent),
    Join(MembershipEvent),
    Leave(MembershipEvent),
    LeaveAll(ConnectionEvent),
    Broadcast(BroadcastEvent),
    /// Client -> hub message
    Emit(MessageEvent),
    /// Hub -> client message
    Recv(MessageEvent),
}

impl CanonicalEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CanonicalEvent::Connect(_) => EventKind::Connect,
            CanonicalEvent::Disconnect(_) => EventKind::Disconnect,
            CanonicalEvent::Join(_) => EventKind::Join,
            CanonicalEvent::Leave(_) => EventKind::Leave,
            CanonicalEvent::LeaveAll(_) => EventKind::LeaveAll,
            CanonicalEvent::Broadcast(_) => EventKind::Broadcast,
            CanonicalEvent::Emit(_) => EventKind::Emit,
            CanonicalEvent::Recv(_) => EventKind::Recv,
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Rebuild an event from its message name and body
    pub fn from_wire(kind: EventKind, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EventKind::Connect => CanonicalEvent::Connect(serde_json::from_value(data)?),
            EventKind::Disconnect => CanonicalEvent::Disconnect(serde_json::from_value(data)?),
            EventKind::Join => CanonicalEvent::Join(serde_json::from_value(data)?),
            EventKind::Leave => CanonicalEvent::Leave(serde_json::from_value(data)?),
            EventKind::LeaveAll => CanonicalEvent::LeaveAll(serde_json::from_value(data)?),
            EventKind::Broadcast => CanonicalEvent::Broadcast(serde_json::from_value(data)?),
            EventKind::Emit => CanonicalEvent::Emit(serde_json::from_value(data)?),
            EventKind::Recv => CanonicalEvent::Recv(serde_json::from_value(data)?),
        })
    }

    pub fn connect(id: impl Into<SocketId>) -> Self {
        CanonicalEvent::Connect(ConnectionEvent { id: id.into() })
    }

    pub fn disconnect(id: impl Into<SocketId>) -> Self {
        CanonicalEvent::Disconnect(ConnectionEvent { id: id.into() })
    }

    pub fn join(id: impl Into<SocketId>, room: impl Into<RoomName>) -> Self {
        CanonicalEvent::Join(MembershipEvent {
            id: id.into(),
            room: room.into(),
        })
    }

    pub fn leave(id: impl Into<SocketId>, room: impl Into<RoomName>) -> Self {
        CanonicalEvent::Leave(MembershipEvent {
            id: id.into(),
            room: room.into(),
        })
    }

    pub fn leave_all(id: impl Into<SocketId>) -> Self {
        CanonicalEvent::LeaveAll(ConnectionEvent { id: id.into() })
    }
}

/// Handler invoked for each published event of a subscribed kind
pub type EventHandler = Arc<dyn Fn(&CanonicalEvent) + Send + Sync>;

/// Handle returned by [`EventHub::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: EventHandler,
}

/// Publish point for canonical events of one monitored hub
///
/// Publishes are serialized: every subscriber sees events in the same order,
/// and all handlers for event N run before any handler for event N+1. The
/// publish lock is reentrant, so a handler may itself publish.
pub struct EventHub {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
    publish_lock: ReentrantMutex<()>,
    view: Arc<dyn MembershipView>,
}

impl EventHub {
    pub fn new(view: Arc<dyn MembershipView>) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            publish_lock: ReentrantMutex::new(()),
            view,
        }
    }

    /// Register a handler for every future event of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&CanonicalEvent) + Send + Sync + 'static,
    {
        self.subscribe_shared(kind, Arc::new(handler))
    }

    /// Register the same handler for every kind
    pub fn subscribe_all(&self, handler: EventHandler) -> Vec<SubscriptionId> {
        EventKind::ALL
            .into_iter()
            .map(|kind| self.subscribe_shared(kind, handler.clone()))
            .collect()
    }

    fn subscribe_shared(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push(Subscriber { id, kind, handler });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().iter().filter(|s| s.kind == kind).count()
    }

    pub fn total_listeners(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Deliver an event to the current subscribers of its kind, in
    /// subscription order
    ///
    /// A panicking handler is logged and skipped; the remaining handlers
    /// still run.
    pub fn publish(&self, event: CanonicalEvent) {
        let _guard = self.publish_lock.lock();
        let kind = event.kind();

        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.handler.clone())
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(kind = %kind, "Event handler panicked");
            }
        }
    }

    /// Current rooms and sockets of the monitored hub
    pub async fn snapshot(&self) -> Result<StateSnapshot, MonitorError> {
        Ok(compute_snapshot(self.view.as_ref())?)
    }
}
