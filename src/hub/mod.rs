//! Hub collaborator interfaces
//!
//! The monitored pub/sub hub is not part of this crate. These traits describe
//! what the monitor needs from it:
//! - an [`Adapter`]: the membership store (room -> members) plus broadcast
//! - a [`Connection`]: one connected client, with outbound and inbound traffic
//!
//! [`memory`] contains a small in-memory implementation used by the demo CLI
//! and the tests.

pub mod memory;

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identity of one connected client of the hub
pub type SocketId = String;

/// Name of a room
pub type RoomName = String;

/// Runs once when a connection goes away
pub type DisconnectHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("unknown connection: {0}")]
    UnknownConnection(SocketId),

    #[error("connection closed: {0}")]
    ConnectionClosed(SocketId),

    #[error("membership store unavailable: {0}")]
    Unavailable(String),
}

/// Frame types carried by a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    Error,
    BinaryEvent,
    BinaryAck,
}

impl PacketKind {
    /// Data frames carry an application event; everything else is control
    pub fn is_data(&self) -> bool {
        matches!(self, PacketKind::Event | PacketKind::BinaryEvent)
    }
}

/// A frame handed to [`Adapter::broadcast`]
///
/// For data frames `data[0]` is the event name and the rest are its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub namespace: String,
    pub data: Vec<Value>,
}

impl Packet {
    /// Build an event frame on the default namespace
    pub fn event(name: &str, args: Vec<Value>) -> Self {
        let mut data = Vec::with_capacity(args.len() + 1);
        data.push(Value::String(name.to_string()));
        data.extend(args);

        Self {
            kind: PacketKind::Event,
            namespace: "/".to_string(),
            data,
        }
    }

    /// Build a control frame with no payload
    pub fn control(kind: PacketKind) -> Self {
        Self {
            kind,
            namespace: "/".to_string(),
            data: Vec::new(),
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.data.first().and_then(Value::as_str)
    }

    pub fn args(&self) -> &[Value] {
        self.data.get(1..).unwrap_or(&[])
    }
}

/// Delivery modifiers attached to a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastFlags {
    pub volatile: bool,
    pub compress: bool,
    pub local: bool,
    pub binary: bool,
}

impl BroadcastFlags {
    /// Names of the flags currently set, in declaration order
    pub fn active(&self) -> Vec<String> {
        [
            ("volatile", self.volatile),
            ("compress", self.compress),
            ("local", self.local),
            ("binary", self.binary),
        ]
        .into_iter()
        .filter(|(_, on)| *on)
        .map(|(name, _)| name.to_string())
        .collect()
    }
}

/// Target selection for a broadcast
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastOptions {
    /// Rooms to deliver to; empty means every connection
    pub rooms: Vec<RoomName>,
    /// Connections to skip
    pub except: Vec<SocketId>,
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    pub fn to_rooms<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<RoomName>,
    {
        Self {
            rooms: rooms.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: BroadcastFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Acknowledgement callback passed as the last argument of a message
pub type AckFn = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// One argument of a per-connection message
#[derive(Clone)]
pub enum Arg {
    Value(Value),
    Ack(AckFn),
}

impl Arg {
    pub fn ack<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        Arg::Ack(Arc::new(f))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            Arg::Ack(_) => None,
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Value(v) => write!(f, "Value({})", v),
            Arg::Ack(_) => write!(f, "Ack(<fn>)"),
        }
    }
}

/// Members of one room as stored by the hub
///
/// Each member carries the store's membership flag; only members whose flag
/// is set count as present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMembership {
    pub name: RoomName,
    pub members: Vec<(SocketId, bool)>,
}

/// Read access to the hub's membership data
pub trait MembershipView: Send + Sync {
    /// All rooms with their members, copied in one consistent pass
    fn rooms(&self) -> Result<Vec<RoomMembership>, HubError>;
}

/// The hub's membership store and broadcast operation
pub trait Adapter: MembershipView {
    /// Add a member to a room
    fn add(&self, id: &str, room: &str) -> Result<(), HubError>;

    /// Remove a member from a room
    fn del(&self, id: &str, room: &str) -> Result<(), HubError>;

    /// Remove a member from every room it belongs to
    fn del_all(&self, id: &str) -> Result<(), HubError>;

    /// Deliver a frame to the selected connections, returning how many
    /// connections received it
    fn broadcast(&self, packet: &Packet, opts: &BroadcastOptions) -> Result<usize, HubError>;
}

/// A single connected client of the hub
pub trait Connection: Send + Sync {
    fn id(&self) -> &str;

    /// Hub -> client message
    fn emit(&self, event: &str, args: Vec<Arg>) -> Result<(), HubError>;

    /// Client -> hub message, handed to the hub's handlers
    fn dispatch(&self, event: &str, args: Vec<Arg>) -> Result<(), HubError>;

    /// Register `hook` for the connection's disconnect. A connection that is
    /// already closed runs it straight away.
    fn on_disconnect(&self, hook: DisconnectHook);
}

impl<T: MembershipView + ?Sized> MembershipView for Arc<T> {
    fn rooms(&self) -> Result<Vec<RoomMembership>, HubError> {
        (**self).rooms()
    }
}

impl<T: Adapter + ?Sized> Adapter for Arc<T> {
    fn add(&self, id: &str, room: &str) -> Result<(), HubError> {
        (**self).add(id, room)
    }

    fn del(&self, id: &str, room: &str) -> Result<(), HubError> {
        (**self).del(id, room)
    }

    fn del_all(&self, id: &str) -> Result<(), HubError> {
        (**self).del_all(id)
    }

    fn broadcast(&self, packet: &Packet, opts: &BroadcastOptions) -> Result<usize, HubError> {
        (**self).broadcast(packet, opts)
    }
}

impl<T: Connection + ?Sized> Connection for Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn emit(&self, event: &str, args: Vec<Arg>) -> Result<(), HubError> {
        (**self).emit(event, args)
    }

    fn dispatch(&self, event: &str, args: Vec<Arg>) -> Result<(), HubError> {
        (**self).dispatch(event, args)
    }

    fn on_disconnect(&self, hook: DisconnectHook) {
        (**self).on_disconnect(hook)
    }
}
