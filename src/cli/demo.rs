//! Scripted traffic for `hubmon serve`
//!
//! Cycles through connects, joins, broadcasts, messages in both directions
//! and disconnects so a watching client sees every event kind.

use hubmon::hub::memory::{MemoryAdapter, MemoryConnection};
use hubmon::hub::{Adapter, Arg, BroadcastFlags, BroadcastOptions, Connection, HubError, Packet};
use hubmon::{Monitor, MonitoredConnection};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const ROOMS: [&str; 3] = ["lobby", "games", "support"];

/// Most connections kept open before the oldest is dropped
const MAX_CONNECTIONS: usize = 4;

pub struct DemoTraffic {
    monitor: Arc<Monitor<MemoryAdapter>>,
    hub: Arc<MemoryAdapter>,
    connections: VecDeque<MonitoredConnection<Arc<MemoryConnection>>>,
    step: u64,
    next_user: u64,
}

impl DemoTraffic {
    pub fn new(monitor: Arc<Monitor<MemoryAdapter>>, hub: Arc<MemoryAdapter>) -> Self {
        Self {
            monitor,
            hub,
            connections: VecDeque::new(),
            step: 0,
            next_user: 1,
        }
    }

    /// Run one scripted operation
    pub fn step(&mut self) -> Result<(), HubError> {
        let phase = self.step % 6;
        self.step += 1;

        if self.connections.is_empty() || phase == 0 {
            return self.connect();
        }

        let adapter = self.monitor.adapter();
        let pick = (self.step as usize) % self.connections.len();
        let Some(conn) = self.connections.get(pick) else {
            return Ok(());
        };
        let id = conn.id().to_string();
        let room = ROOMS[(self.step as usize) % ROOMS.len()];

        match phase {
            1 => adapter.add(&id, room),
            2 => {
                let packet = Packet::event("chat", vec![json!({ "from": id, "step": self.step })]);
                let opts = BroadcastOptions::to_rooms([room]).with_flags(BroadcastFlags {
                    volatile: self.step % 4 == 0,
                    ..BroadcastFlags::default()
                });
                adapter.broadcast(&packet, &opts).map(|_| ())
            }
            3 => conn.dispatch(
                "ping",
                vec![Arg::Value(json!(self.step)), Arg::ack(|_| {})],
            ),
            4 => conn.emit("notice", vec![Arg::Value(json!({ "text": "welcome" }))]),
            _ => {
                adapter.del(&id, room)?;
                if self.connections.len() >= MAX_CONNECTIONS {
                    self.disconnect_oldest()?;
                }
                Ok(())
            }
        }
    }

    fn connect(&mut self) -> Result<(), HubError> {
        let id = format!("user-{}", self.next_user);
        self.next_user += 1;

        let inner = self.hub.connect(id.clone());
        inner.on("ping", |args| Some(json!({ "pong": args.first().cloned() })));

        let conn = self.monitor.on_connection(inner);
        let adapter = self.monitor.adapter();
        adapter.add(&id, &id)?;
        adapter.add(&id, ROOMS[0])?;

        debug!(socket = %id, "Demo connection opened");
        self.connections.push_back(conn);
        Ok(())
    }

    fn disconnect_oldest(&mut self) -> Result<(), HubError> {
        let Some(conn) = self.connections.pop_front() else {
            return Ok(());
        };
        let id = conn.id().to_string();

        self.monitor.adapter().del_all(&id)?;
        // Publishes `disconnect` through the wrapper's hook
        self.hub.disconnect(&id);
        drop(conn);

        debug!(socket = %id, "Demo connection closed");
        Ok(())
    }

    /// Step forever at `interval`
    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.step() {
                warn!(error = %e, "Demo step failed");
            }
        }
    }
}
