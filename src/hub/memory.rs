//! In-memory reference hub
//!
//! Keeps room membership in ordered maps and delivers frames into per
//! connection outboxes. Used by the demo server and the tests; a production
//! hub implements [`Adapter`] and [`Connection`] over its own state.

use super::{
    Adapter, Arg, BroadcastOptions, Connection, DisconnectHook, HubError, MembershipView, Packet,
    RoomMembership, RoomName, SocketId,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Handler registered on a connection for an inbound event
///
/// The returned value, if any, is passed to the sender's acknowledgement
/// callback.
pub type EventHandler = Arc<dyn Fn(&[Value]) -> Option<Value> + Send + Sync>;

/// Something delivered to a connection
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Sent directly with [`Connection::emit`]
    Emitted { event: String, args: Vec<Value> },
    /// Received through [`Adapter::broadcast`]
    Broadcast(Packet),
}

/// A connected client of the in-memory hub
pub struct MemoryConnection {
    id: SocketId,
    outbox: Mutex<Vec<Delivery>>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    // `closed` flips while this is held
    on_close: Mutex<Vec<DisconnectHook>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn new(id: impl Into<SocketId>) -> Self {
        Self {
            id: id.into(),
            outbox: Mutex::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            on_close: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a handler for an inbound event
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&[Value]) -> Option<Value> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Drain everything delivered so far
    pub fn take_outbox(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.outbox.lock())
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Mark the connection closed and run its disconnect hooks. Only the
    /// first call does anything.
    pub fn close(&self) {
        let hooks = {
            let mut on_close = self.on_close.lock();
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            std::mem::take(&mut *on_close)
        };

        debug!(socket_id = %self.id, hooks = hooks.len(), "Connection closed");
        for hook in hooks {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn deliver(&self, delivery: Delivery) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed(self.id.clone()));
        }
        self.outbox.lock().push(delivery);
        Ok(())
    }
}

fn split_ack(args: Vec<Arg>) -> (Vec<Value>, Option<super::AckFn>) {
    let mut values = Vec::with_capacity(args.len());
    let mut ack = None;
    for arg in args {
        match arg {
            Arg::Value(v) => values.push(v),
            Arg::Ack(f) => ack = Some(f),
        }
    }
    (values, ack)
}

impl Connection for MemoryConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn emit(&self, event: &str, args: Vec<Arg>) -> Result<(), HubError> {
        let (args, _) = split_ack(args);
        self.deliver(Delivery::Emitted {
            event: event.to_string(),
            args,
        })
    }

    fn dispatch(&self, event: &str, args: Vec<Arg>) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::ConnectionClosed(self.id.clone()));
        }

        let (args, ack) = split_ack(args);
        let handlers = self.handlers.read().get(event).cloned().unwrap_or_default();

        for handler in handlers {
            if let Some(reply) = handler(&args) {
                if let Some(ack) = &ack {
                    ack(vec![reply]);
                }
            }
        }

        Ok(())
    }

    fn on_disconnect(&self, hook: DisconnectHook) {
        {
            let mut on_close = self.on_close.lock();
            if !self.is_closed() {
                on_close.push(hook);
                return;
            }
        }
        hook();
    }
}

/// Membership store and connection registry of the in-memory hub
pub struct MemoryAdapter {
    rooms: RwLock<BTreeMap<RoomName, BTreeMap<SocketId, bool>>>,
    connections: DashMap<SocketId, Arc<MemoryConnection>>,
    offline: AtomicBool,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(BTreeMap::new()),
            connections: DashMap::new(),
            offline: AtomicBool::new(false),
        }
    }

    /// Register a new connection
    pub fn connect(&self, id: impl Into<SocketId>) -> Arc<MemoryConnection> {
        let conn = Arc::new(MemoryConnection::new(id));
        self.connections.insert(conn.id.clone(), conn.clone());
        debug!(socket_id = %conn.id, "Connection registered");
        conn
    }

    /// Unregister a connection. Room membership is left to [`Adapter::del_all`].
    pub fn disconnect(&self, id: &str) -> Option<Arc<MemoryConnection>> {
        let (_, conn) = self.connections.remove(id)?;
        conn.close();
        Some(conn)
    }

    pub fn get(&self, id: &str) -> Option<Arc<MemoryConnection>> {
        self.connections.get(id).map(|r| r.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Active members of a room
    pub fn members(&self, room: &str) -> Vec<SocketId> {
        self.rooms
            .read()
            .get(room)
            .map(|m| m.iter().filter(|(_, on)| **on).map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Clear a member's flag without removing it, as a store does while a
    /// leave is in flight
    pub fn deactivate(&self, id: &str, room: &str) {
        if let Some(members) = self.rooms.write().get_mut(room) {
            if let Some(flag) = members.get_mut(id) {
                *flag = false;
            }
        }
    }

    /// Make membership reads fail, for exercising snapshot errors
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn targets(&self, opts: &BroadcastOptions) -> Vec<Arc<MemoryConnection>> {
        let ids: BTreeSet<SocketId> = if opts.rooms.is_empty() {
            self.connections.iter().map(|e| e.key().clone()).collect()
        } else {
            let rooms = self.rooms.read();
            opts.rooms
                .iter()
                .filter_map(|r| rooms.get(r))
                .flat_map(|m| m.iter().filter(|(_, on)| **on).map(|(id, _)| id.clone()))
                .collect()
        };

        ids.into_iter()
            .filter(|id| !opts.except.contains(id))
            .filter_map(|id| self.get(&id))
            .collect()
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipView for MemoryAdapter {
    fn rooms(&self) -> Result<Vec<RoomMembership>, HubError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(HubError::Unavailable("membership store offline".to_string()));
        }

        let rooms = self.rooms.read();
        Ok(rooms
            .iter()
            .map(|(name, members)| RoomMembership {
                name: name.clone(),
                members: members.iter().map(|(id, on)| (id.clone(), *on)).collect(),
            })
            .collect())
    }
}

impl Adapter for MemoryAdapter {
    fn add(&self, id: &str, room: &str) -> Result<(), HubError> {
        self.rooms
            .write()
            .entry(room.to_string())
            .or_default()
            .insert(id.to_string(), true);
        Ok(())
    }

    fn del(&self, id: &str, room: &str) -> Result<(), HubError> {
        let mut rooms = self.rooms.write();
        if let Some(members) = rooms.get_mut(room) {
            members.remove(id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        Ok(())
    }

    fn del_all(&self, id: &str) -> Result<(), HubError> {
        let mut rooms = self.rooms.write();
        for members in rooms.values_mut() {
            members.remove(id);
        }
        rooms.retain(|_, members| !members.is_empty());
        Ok(())
    }

    fn broadcast(&self, packet: &Packet, opts: &BroadcastOptions) -> Result<usize, HubError> {
        let mut delivered = 0;
        for conn in self.targets(opts) {
            if conn.deliver(Delivery::Broadcast(packet.clone())).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_membership_add_del() {
        let adapter = MemoryAdapter::new();
        adapter.add("a", "lobby").unwrap();
        adapter.add("b", "lobby").unwrap();
        assert_eq!(adapter.members("lobby"), vec!["a", "b"]);

        adapter.del("a", "lobby").unwrap();
        assert_eq!(adapter.members("lobby"), vec!["b"]);

        adapter.del("b", "lobby").unwrap();
        assert!(adapter.rooms().unwrap().is_empty());
    }

    #[test]
    fn test_del_all_removes_every_membership() {
        let adapter = MemoryAdapter::new();
        adapter.add("a", "a").unwrap();
        adapter.add("a", "lobby").unwrap();
        adapter.add("b", "lobby").unwrap();

        adapter.del_all("a").unwrap();

        let rooms = adapter.rooms().unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].name, "lobby");
        assert_eq!(rooms[0].members, vec![("b".to_string(), true)]);
    }

    #[test]
    fn test_broadcast_to_room_and_except() {
        let adapter = MemoryAdapter::new();
        let a = adapter.connect("a");
        let b = adapter.connect("b");
        let c = adapter.connect("c");
        adapter.add("a", "r1").unwrap();
        adapter.add("b", "r1").unwrap();

        let packet = Packet::event("chat", vec![json!("hi")]);
        let mut opts = BroadcastOptions::to_rooms(["r1"]);
        opts.except.push("b".to_string());

        assert_eq!(adapter.broadcast(&packet, &opts).unwrap(), 1);
        assert_eq!(a.take_outbox(), vec![Delivery::Broadcast(packet)]);
        assert_eq!(b.outbox_len(), 0);
        assert_eq!(c.outbox_len(), 0);
    }

    #[test]
    fn test_broadcast_without_rooms_reaches_everyone() {
        let adapter = MemoryAdapter::new();
        adapter.connect("a");
        adapter.connect("b");

        let delivered = adapter
            .broadcast(&Packet::event("news", vec![]), &BroadcastOptions::default())
            .unwrap();
        assert_eq!(delivered, 2);
    }

    #[test]
    fn test_dispatch_runs_handlers_and_acks() {
        let conn = MemoryConnection::new("a");
        conn.on("ping", |args| Some(json!({ "pong": args.len() })));

        let acked = Arc::new(Mutex::new(Vec::new()));
        let sink = acked.clone();
        conn.dispatch(
            "ping",
            vec![Arg::Value(json!(1)), Arg::ack(move |reply| sink.lock().extend(reply))],
        )
        .unwrap();

        assert_eq!(*acked.lock(), vec![json!({ "pong": 1 })]);
    }

    #[test]
    fn test_closed_connection_rejects_traffic() {
        let adapter = MemoryAdapter::new();
        let conn = adapter.connect("a");
        adapter.disconnect("a");

        assert_eq!(
            conn.emit("hello", vec![]),
            Err(HubError::ConnectionClosed("a".to_string()))
        );
        assert_eq!(adapter.connection_count(), 0);
    }

    #[test]
    fn test_disconnect_runs_hooks_once() {
        let adapter = MemoryAdapter::new();
        let conn = adapter.connect("a");
        let fired = Arc::new(Mutex::new(0));

        let counter = fired.clone();
        conn.on_disconnect(Box::new(move || *counter.lock() += 1));

        adapter.disconnect("a");
        conn.close();
        assert_eq!(*fired.lock(), 1);

        // Registering after the fact runs the hook immediately
        let counter = fired.clone();
        conn.on_disconnect(Box::new(move || *counter.lock() += 1));
        assert_eq!(*fired.lock(), 2);
    }

    #[test]
    fn test_inactive_members_are_not_present() {
        let adapter = MemoryAdapter::new();
        adapter.add("a", "lobby").unwrap();
        adapter.add("b", "lobby").unwrap();

        adapter.deactivate("a", "lobby");

        assert_eq!(adapter.members("lobby"), vec!["b"]);
        let rooms = adapter.rooms().unwrap();
        assert_eq!(
            rooms[0].members,
            vec![("a".to_string(), false), ("b".to_string(), true)]
        );
    }

    #[test]
    fn test_offline_store_fails_reads() {
        let adapter = MemoryAdapter::new();
        adapter.set_offline(true);
        assert!(matches!(adapter.rooms(), Err(HubError::Unavailable(_))));
    }
}
