//! Capturing decorators for the hub
//!
//! [`MonitoredAdapter`] and [`MonitoredConnection`] implement the same traits
//! as the objects they wrap. Each intercepted call publishes one canonical
//! event and then delegates with the same arguments, returning the inner
//! result untouched. Capture never fails the wrapped call.

use crate::events::{BroadcastEvent, CanonicalEvent, EventHub, MessageEvent};
use crate::hub::{
    Adapter, Arg, BroadcastOptions, Connection, DisconnectHook, HubError, MembershipView, Packet,
    RoomMembership, SocketId,
};
use serde_json::Value;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

/// Build and publish an event, swallowing any failure
fn capture<F>(events: &EventHub, build: F)
where
    F: FnOnce() -> Option<CanonicalEvent>,
{
    let result = catch_unwind(AssertUnwindSafe(|| {
        if let Some(event) = build() {
            events.publish(event);
        }
    }));

    if result.is_err() {
        warn!("Event capture failed; hub operation continues");
    }
}

/// Broadcast event for a frame, or `None` for control frames
pub fn broadcast_event(packet: &Packet, opts: &BroadcastOptions) -> Option<CanonicalEvent> {
    if !packet.kind.is_data() {
        return None;
    }

    let Some(name) = packet.event_name() else {
        warn!(kind = ?packet.kind, "Data frame without an event name, not captured");
        return None;
    };

    // Rooms are a set; first mention wins
    let mut seen = HashSet::new();
    let rooms = opts
        .rooms
        .iter()
        .filter(|room| seen.insert(room.as_str()))
        .cloned()
        .collect();

    Some(CanonicalEvent::Broadcast(BroadcastEvent {
        name: name.to_string(),
        args: packet.args().to_vec(),
        rooms,
        flags: opts.flags.active(),
    }))
}

/// Serializable view of message arguments
///
/// A trailing acknowledgement callback is dropped; a callback anywhere else
/// is recorded as `null`.
pub fn capture_args(args: &[Arg]) -> Vec<Value> {
    let args = match args.split_last() {
        Some((Arg::Ack(_), rest)) => rest,
        _ => args,
    };

    args.iter()
        .map(|a| a.as_value().cloned().unwrap_or(Value::Null))
        .collect()
}

/// Membership store wrapper that reports joins, leaves and broadcasts
pub struct MonitoredAdapter<A> {
    inner: Arc<A>,
    events: Arc<EventHub>,
}

impl<A: Adapter> MonitoredAdapter<A> {
    pub fn new(inner: Arc<A>, events: Arc<EventHub>) -> Self {
        Self { inner, events }
    }
}

impl<A: Adapter> MembershipView for MonitoredAdapter<A> {
    fn rooms(&self) -> Result<Vec<RoomMembership>, HubError> {
        self.inner.rooms()
    }
}

impl<A: Adapter> Adapter for MonitoredAdapter<A> {
    fn add(&self, id: &str, room: &str) -> Result<(), HubError> {
        // Joining the room named after yourself is the implicit personal room
        if id != room {
            capture(&self.events, || Some(CanonicalEvent::join(id, room)));
        }
        self.inner.add(id, room)
    }

    fn del(&self, id: &str, room: &str) -> Result<(), HubError> {
        capture(&self.events, || Some(CanonicalEvent::leave(id, room)));
        self.inner.del(id, room)
    }

    fn del_all(&self, id: &str) -> Result<(), HubError> {
        capture(&self.events, || Some(CanonicalEvent::leave_all(id)));
        self.inner.del_all(id)
    }

    fn broadcast(&self, packet: &Packet, opts: &BroadcastOptions) -> Result<usize, HubError> {
        capture(&self.events, || broadcast_event(packet, opts));
        self.inner.broadcast(packet, opts)
    }
}

/// Publishes `disconnect` for one connection, at most once
struct DisconnectNotice {
    id: SocketId,
    // Weak: the hook lives inside the hub, which the event hub can reach
    events: Weak<EventHub>,
    fired: AtomicBool,
}

impl DisconnectNotice {
    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(events) = self.events.upgrade() {
            capture(&events, || Some(CanonicalEvent::disconnect(self.id.clone())));
        }
        true
    }
}

/// Connection wrapper that reports the connection's traffic and lifecycle
///
/// Creating it publishes `connect` and registers for the connection's
/// disconnect notification, which publishes `disconnect`. Hubs without such a
/// notification can call [`disconnected`](Self::disconnected); dropping the
/// wrapper reports it as a last resort. Either way `disconnect` is published
/// at most once.
pub struct MonitoredConnection<C> {
    inner: C,
    events: Arc<EventHub>,
    notice: Arc<DisconnectNotice>,
}

impl<C: Connection> MonitoredConnection<C> {
    pub fn new(inner: C, events: Arc<EventHub>) -> Self {
        capture(&events, || Some(CanonicalEvent::connect(inner.id())));

        let notice = Arc::new(DisconnectNotice {
            id: inner.id().to_string(),
            events: Arc::downgrade(&events),
            fired: AtomicBool::new(false),
        });
        let hook = notice.clone();
        inner.on_disconnect(Box::new(move || {
            hook.fire();
        }));

        Self {
            inner,
            events,
            notice,
        }
    }

    /// Report that the hub lost this connection. Returns true only if this
    /// call published the `disconnect`.
    pub fn disconnected(&self) -> bool {
        self.notice.fire()
    }

    pub fn is_disconnected(&self) -> bool {
        self.notice.fired.load(Ordering::SeqCst)
    }

    fn message(&self, event: &str, args: &[Arg]) -> MessageEvent {
        MessageEvent {
            id: self.inner.id().to_string(),
            name: event.to_string(),
            args: capture_args(args),
        }
    }
}

impl<C: Connection> Connection for MonitoredConnection<C> {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn emit(&self, event: &str, args: Vec<Arg>) -> Result<(), HubError> {
        capture(&self.events, || Some(CanonicalEvent::Recv(self.message(event, &args))));
        self.inner.emit(event, args)
    }

    fn dispatch(&self, event: &str, args: Vec<Arg>) -> Result<(), HubError> {
        capture(&self.events, || Some(CanonicalEvent::Emit(self.message(event, &args))));
        self.inner.dispatch(event, args)
    }

    fn on_disconnect(&self, hook: DisconnectHook) {
        self.inner.on_disconnect(hook)
    }
}

impl<C> Drop for MonitoredConnection<C> {
    fn drop(&mut self) {
        self.notice.fire();
    }
}
