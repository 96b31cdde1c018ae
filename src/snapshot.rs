//! Room and socket membership snapshots
//!
//! A snapshot is derived from the hub's membership store each time it is
//! requested; nothing is cached between requests.

use crate::hub::{HubError, MembershipView, RoomName, SocketId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One room and its active members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomState {
    pub name: RoomName,
    pub sockets: Vec<SocketId>,
}

/// Current rooms and connected sockets of the hub
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Shared rooms; personal rooms are left out
    pub rooms: Vec<RoomState>,
    /// Every active member of any room, each listed once in first-seen order
    pub sockets: Vec<SocketId>,
}

impl StateSnapshot {
    pub fn room(&self, name: &str) -> Option<&RoomState> {
        self.rooms.iter().find(|r| r.name == name)
    }
}

/// A personal room holds exactly one member whose identity is the room name
fn is_personal_room(name: &str, members: &[SocketId]) -> bool {
    members.len() == 1 && members[0] == name
}

/// Build a snapshot from one consistent read of the membership store
///
/// Room order follows the store's own iteration order.
pub fn compute_snapshot(view: &dyn MembershipView) -> Result<StateSnapshot, HubError> {
    let mut snapshot = StateSnapshot::default();
    let mut seen = HashSet::new();

    for room in view.rooms()? {
        let members: Vec<SocketId> = room
            .members
            .into_iter()
            .filter(|(_, active)| *active)
            .map(|(id, _)| id)
            .collect();

        for id in &members {
            if seen.insert(id.clone()) {
                snapshot.sockets.push(id.clone());
            }
        }

        if members.is_empty() || is_personal_room(&room.name, &members) {
            continue;
        }

        snapshot.rooms.push(RoomState {
            name: room.name,
            sockets: members,
        });
    }

    Ok(snapshot)
}
