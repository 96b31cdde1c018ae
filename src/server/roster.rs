//! Authorized sessions and event fan-out

use crate::events::{CanonicalEvent, EventHub, EventKind, SubscriptionId};
use crate::server::session::Session;
use crate::server::wire::WireMessage;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Ordered set of authorized sessions
///
/// Order is admission order, and dispatch walks it front to back.
#[derive(Default)]
pub struct Roster {
    sessions: RwLock<Vec<Arc<Session>>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Admitting the same session twice is a no-op.
    pub fn admit(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.iter().any(|s| s.id() == session.id()) {
            return false;
        }
        sessions.push(session);
        true
    }

    /// Remove a session. Returns the session the first time only.
    pub fn retire(&self, id: Uuid) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let pos = sessions.iter().position(|s| s.id() == id)?;
        Some(sessions.remove(pos))
    }

    /// Point-in-time copy, safe to iterate while sessions come and go
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.read().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().iter().find(|s| s.id() == id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.read().iter().any(|s| s.id() == id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Queue a message for every session, in roster order
    ///
    /// Full or closed queues are skipped. Returns how many sessions took the
    /// message.
    pub fn fan_out(&self, msg: &WireMessage) -> usize {
        let sessions = self.sessions();
        if sessions.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for session in sessions {
            match session.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    // Expected while a client lags or disconnects
                    debug!(
                        session_id = %session.id(),
                        event = %msg.name,
                        error = %e,
                        "Dropped event for session"
                    );
                }
            }
        }
        delivered
    }
}

/// Forwards every canonical event to every session in the roster
///
/// Holds one subscription per event kind for the lifetime of the monitor;
/// sessions themselves never subscribe.
pub struct Dispatcher {
    events: Arc<EventHub>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl Dispatcher {
    pub fn start(events: Arc<EventHub>, roster: Arc<Roster>) -> Self {
        let subscriptions = EventKind::ALL
            .into_iter()
            .map(|kind| {
                let roster = roster.clone();
                events.subscribe(kind, move |event: &CanonicalEvent| {
                    dispatch(&roster, event);
                })
            })
            .collect();

        Self {
            events,
            subscriptions: Mutex::new(subscriptions),
        }
    }

    /// Drop the subscriptions. Safe to call more than once.
    pub fn stop(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.events.unsubscribe(id);
        }
    }

    pub fn is_running(&self) -> bool {
        !self.subscriptions.lock().is_empty()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch(roster: &Roster, event: &CanonicalEvent) {
    if roster.is_empty() {
        return;
    }

    // Serialize once for all sessions
    match WireMessage::event(event) {
        Ok(msg) => {
            roster.fan_out(&msg);
        }
        Err(e) => {
            warn!(kind = %event.kind(), error = %e, "Failed to encode event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEvent;
    use crate::hub::memory::MemoryAdapter;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<EventHub>, Arc<Roster>) {
        let events = Arc::new(EventHub::new(Arc::new(MemoryAdapter::new())));
        (events, Arc::new(Roster::new()))
    }

    #[test]
    fn test_admit_and_retire_are_idempotent() {
        let roster = Roster::new();
        let (session, _rx) = Session::channel("p");
        let session = Arc::new(session);
        let id = session.id();

        assert!(roster.admit(session.clone()));
        assert!(!roster.admit(session));
        assert_eq!(roster.len(), 1);

        assert!(roster.retire(id).is_some());
        assert!(roster.retire(id).is_none());
        assert!(roster.is_empty());
    }

    #[test]
    fn test_retire_keeps_order_of_others() {
        let roster = Roster::new();
        let mut ids = Vec::new();
        let mut queues = Vec::new();
        for _ in 0..3 {
            let (session, rx) = Session::channel("p");
            ids.push(session.id());
            queues.push(rx);
            roster.admit(Arc::new(session));
        }

        roster.retire(ids[1]);
        let remaining: Vec<Uuid> = roster.sessions().iter().map(|s| s.id()).collect();
        assert_eq!(remaining, vec![ids[0], ids[2]]);
    }

    #[test]
    fn test_dispatcher_subscribes_once_per_kind() {
        let (events, roster) = setup();
        let dispatcher = Dispatcher::start(events.clone(), roster);

        for kind in EventKind::ALL {
            assert_eq!(events.listener_count(kind), 1);
        }

        dispatcher.stop();
        dispatcher.stop();
        assert_eq!(events.total_listeners(), 0);
        assert!(!dispatcher.is_running());
    }

    #[tokio::test]
    async fn test_events_reach_every_session() {
        let (events, roster) = setup();
        let _dispatcher = Dispatcher::start(events.clone(), roster.clone());

        let (a, mut rx_a) = Session::channel("a");
        let (b, mut rx_b) = Session::channel("b");
        roster.admit(Arc::new(a));
        roster.admit(Arc::new(b));

        events.publish(CanonicalEvent::join("s1", "lobby"));

        let expected = WireMessage::event(&CanonicalEvent::join("s1", "lobby")).unwrap();
        assert_eq!(rx_a.recv().await, Some(expected.clone()));
        assert_eq!(rx_b.recv().await, Some(expected));
    }

    #[tokio::test]
    async fn test_broadcast_without_flags_reaches_sessions_in_admission_order() {
        let (events, roster) = setup();
        let _dispatcher = Dispatcher::start(events.clone(), roster.clone());

        let (first, mut rx_first) = Session::channel("first");
        let (second, mut rx_second) = Session::channel("second");
        let order = vec![first.id(), second.id()];
        roster.admit(Arc::new(first));
        roster.admit(Arc::new(second));

        let served: Vec<Uuid> = roster.sessions().iter().map(|s| s.id()).collect();
        assert_eq!(served, order);

        events.publish(CanonicalEvent::Broadcast(BroadcastEvent {
            name: "chat".to_string(),
            args: vec![json!("hi")],
            rooms: vec!["r1".to_string()],
            flags: vec![],
        }));

        let expected = WireMessage::new(
            "broadcast",
            json!({ "name": "chat", "args": ["hi"], "rooms": ["r1"], "flags": [] }),
        );
        assert_eq!(rx_first.recv().await, Some(expected.clone()));
        assert_eq!(rx_second.recv().await, Some(expected));
    }

    #[test]
    fn test_each_event_reaches_every_session_before_the_next() {
        let (events, roster) = setup();
        let _dispatcher = Dispatcher::start(events.clone(), roster.clone());

        // One shared queue records the serving sequence across both sessions
        let (tx, mut rx) = mpsc::channel(16);
        roster.admit(Arc::new(Session::new("first", tx.clone())));
        roster.admit(Arc::new(Session::new("second", tx)));

        events.publish(CanonicalEvent::connect("s1"));
        events.publish(CanonicalEvent::connect("s2"));

        let mut ids = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            ids.push(msg.data["id"].as_str().unwrap().to_string());
        }
        assert_eq!(ids, vec!["s1", "s1", "s2", "s2"]);
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_others() {
        let (events, roster) = setup();
        let _dispatcher = Dispatcher::start(events.clone(), roster.clone());

        let (slow_tx, _slow_rx) = mpsc::channel(1);
        roster.admit(Arc::new(Session::new("slow", slow_tx)));
        let (fast, mut fast_rx) = Session::channel("fast");
        roster.admit(Arc::new(fast));

        for i in 0..3 {
            events.publish(CanonicalEvent::connect(format!("s{}", i)));
        }

        for i in 0..3 {
            let msg = fast_rx.recv().await.unwrap();
            assert_eq!(msg.data["id"], format!("s{}", i));
        }
    }

    #[test]
    fn test_retired_session_gets_nothing() {
        let (events, roster) = setup();
        let _dispatcher = Dispatcher::start(events.clone(), roster.clone());
        let before = events.total_listeners();

        let (session, mut rx) = Session::channel("p");
        let id = session.id();
        roster.admit(Arc::new(session));
        roster.retire(id);

        events.publish(CanonicalEvent::connect("s1"));
        assert!(rx.try_recv().is_err());
        assert_eq!(events.total_listeners(), before);
    }
}
