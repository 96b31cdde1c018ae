//! Integration tests for the monitor control channel
//!
//! Real TCP clients against a monitor bound to an ephemeral port.

use hubmon::client::{ClientError, MonitorClient};
use hubmon::events::BroadcastEvent;
use hubmon::hub::memory::MemoryAdapter;
use hubmon::hub::{Adapter, BroadcastFlags, BroadcastOptions, Packet};
use hubmon::server::{JsonLinesSession, WireMessage, WireSession};
use hubmon::{AuthFailure, CanonicalEvent, EventKind, Monitor, MonitorConfig, MonitorError};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start(config: MonitorConfig) -> (Arc<MemoryAdapter>, Monitor<MemoryAdapter>, SocketAddr) {
    let hub = Arc::new(MemoryAdapter::new());
    let monitor = Monitor::attach(hub.clone(), config.host("127.0.0.1").port(0))
        .await
        .unwrap();
    let addr = monitor.listener().unwrap().local_addr();
    (hub, monitor, addr)
}

async fn recv(wire: &mut JsonLinesSession) -> Option<WireMessage> {
    timeout(WAIT, wire.recv())
        .await
        .expect("timed out waiting for message")
        .map(|r| r.unwrap())
}

async fn wait_for_roster(monitor: &Monitor<MemoryAdapter>, len: usize) {
    timeout(WAIT, async {
        while monitor.roster().len() != len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("roster never reached expected size");
}

#[tokio::test]
async fn test_open_monitor_sends_single_init() {
    let (hub, monitor, addr) = start(MonitorConfig::new()).await;
    hub.add("s1", "lobby").unwrap();

    let mut wire = JsonLinesSession::connect(addr).await.unwrap();
    assert_eq!(recv(&mut wire).await, Some(WireMessage::req_auth(false)));

    wire.send(WireMessage::password("")).await.unwrap();

    // No auth message without a password; init comes straight away
    let init = recv(&mut wire).await.unwrap();
    assert_eq!(init.name, "init");
    assert_eq!(
        init.data,
        json!({ "rooms": [{ "name": "lobby", "sockets": ["s1"] }], "sockets": ["s1"] })
    );

    monitor.adapter().add("s2", "lobby").unwrap();
    let next = recv(&mut wire).await.unwrap();
    assert_eq!(next, WireMessage::new("join", json!({ "id": "s2", "room": "lobby" })));
}

#[tokio::test]
async fn test_nothing_sent_before_password_answer() {
    let (_hub, monitor, addr) = start(MonitorConfig::new()).await;

    let mut wire = JsonLinesSession::connect(addr).await.unwrap();
    assert_eq!(recv(&mut wire).await, Some(WireMessage::req_auth(false)));

    // Not yet admitted, so hub traffic is not relayed
    monitor.events().publish(CanonicalEvent::connect("early"));
    assert!(timeout(Duration::from_millis(100), wire.recv()).await.is_err());
    assert!(monitor.roster().is_empty());
}

#[tokio::test]
async fn test_correct_password_authorizes() {
    let (_hub, monitor, addr) = start(MonitorConfig::new().password("secret")).await;

    let mut wire = JsonLinesSession::connect(addr).await.unwrap();
    assert_eq!(recv(&mut wire).await, Some(WireMessage::req_auth(true)));

    wire.send(WireMessage::password("secret")).await.unwrap();
    assert_eq!(
        recv(&mut wire).await,
        Some(WireMessage::new("auth", json!({ "authorized": true })))
    );
    assert_eq!(recv(&mut wire).await.unwrap().name, "init");
    assert_eq!(monitor.roster().len(), 1);
}

#[tokio::test]
async fn test_wrong_password_rejected_and_closed() {
    let (_hub, monitor, addr) = start(MonitorConfig::new().password("secret")).await;

    let mut wire = JsonLinesSession::connect(addr).await.unwrap();
    recv(&mut wire).await;
    wire.send(WireMessage::password("guess")).await.unwrap();

    assert_eq!(
        recv(&mut wire).await,
        Some(WireMessage::new(
            "auth",
            json!({ "authorized": false, "error": "INVALID_PASSWORD" })
        ))
    );
    assert_eq!(recv(&mut wire).await, None);
    assert!(monitor.roster().is_empty());
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let (_hub, monitor, addr) = start(
        MonitorConfig::new()
            .password("secret")
            .auth_timeout(Duration::from_millis(100)),
    )
    .await;

    let started = Instant::now();
    let mut wire = JsonLinesSession::connect(addr).await.unwrap();
    assert_eq!(recv(&mut wire).await, Some(WireMessage::req_auth(true)));

    assert_eq!(
        recv(&mut wire).await,
        Some(WireMessage::auth_failed(AuthFailure::Timeout))
    );
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(recv(&mut wire).await, None);
    assert!(monitor.roster().is_empty());
}

#[tokio::test]
async fn test_client_library_handshake() {
    let (_hub, _monitor, addr) = start(MonitorConfig::new().password("secret")).await;

    let mut client = MonitorClient::connect(addr, Some("secret")).await.unwrap();
    assert!(client.next_init().await.unwrap().rooms.is_empty());

    match MonitorClient::connect(addr, Some("wrong")).await {
        Err(ClientError::Unauthorized(AuthFailure::InvalidPassword)) => {}
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_init_excludes_personal_rooms() {
    let (hub, _monitor, addr) = start(MonitorConfig::new()).await;
    hub.add("s1", "s1").unwrap();
    hub.add("s2", "s2").unwrap();
    hub.add("s2", "games").unwrap();

    let mut client = MonitorClient::connect(addr, None).await.unwrap();
    let snapshot = timeout(WAIT, client.next_init()).await.unwrap().unwrap();

    assert_eq!(snapshot.rooms.len(), 1);
    assert_eq!(snapshot.room("games").unwrap().sockets, vec!["s2"]);
    assert_eq!(snapshot.sockets.len(), 2);
    assert!(snapshot.sockets.contains(&"s1".to_string()));
}

#[tokio::test]
async fn test_broadcast_reaches_every_session() {
    let (hub, monitor, addr) = start(MonitorConfig::new()).await;
    hub.connect("s1");
    hub.add("s1", "r1").unwrap();

    let mut first = MonitorClient::connect(addr, None).await.unwrap();
    first.next_init().await.unwrap();
    let mut second = MonitorClient::connect(addr, None).await.unwrap();
    second.next_init().await.unwrap();

    let packet = Packet::event("chat", vec![json!("hello")]);
    let opts = BroadcastOptions::to_rooms(["r1"]).with_flags(BroadcastFlags {
        compress: true,
        ..BroadcastFlags::default()
    });
    assert_eq!(monitor.adapter().broadcast(&packet, &opts), Ok(1));

    let expected = CanonicalEvent::Broadcast(BroadcastEvent {
        name: "chat".to_string(),
        args: vec![json!("hello")],
        rooms: vec!["r1".to_string()],
        flags: vec!["compress".to_string()],
    });
    for client in [&mut first, &mut second] {
        let event = timeout(WAIT, client.next_event()).await.unwrap().unwrap();
        assert_eq!(event, Some(expected.clone()));
    }
}

#[tokio::test]
async fn test_retired_session_does_not_affect_others() {
    let (_hub, monitor, addr) = start(MonitorConfig::new()).await;
    let listeners = monitor.events().total_listeners();

    let mut leaving = MonitorClient::connect(addr, None).await.unwrap();
    leaving.next_init().await.unwrap();
    let mut staying = MonitorClient::connect(addr, None).await.unwrap();
    staying.next_init().await.unwrap();
    assert_eq!(monitor.roster().len(), 2);

    leaving.close().await;
    wait_for_roster(&monitor, 1).await;

    monitor.adapter().add("s1", "lobby").unwrap();
    let event = timeout(WAIT, staying.next_event()).await.unwrap().unwrap();
    assert_eq!(event, Some(CanonicalEvent::join("s1", "lobby")));

    assert_eq!(monitor.events().total_listeners(), listeners);
    for kind in EventKind::ALL {
        assert_eq!(monitor.events().listener_count(kind), 1);
    }
}

#[tokio::test]
async fn test_attach_notifications() {
    let (hub, monitor, addr) = start(MonitorConfig::new()).await;
    hub.add("s1", "lobby").unwrap();
    let mut attached = monitor.listener().unwrap().attached();

    let mut client = MonitorClient::connect(addr, None).await.unwrap();
    client.next_init().await.unwrap();

    let note = timeout(WAIT, attached.recv()).await.unwrap().unwrap();
    assert_eq!(note.snapshot.sockets, vec!["s1"]);
    assert!(monitor.roster().contains(note.session_id));
}

#[tokio::test]
async fn test_bind_failure_reported_once() {
    let (_hub, _monitor, addr) = start(MonitorConfig::new()).await;

    let hub = Arc::new(MemoryAdapter::new());
    let config = MonitorConfig::new().host("127.0.0.1").port(addr.port());
    match Monitor::attach(hub, config).await {
        Err(MonitorError::Bind { addr: failed, .. }) => {
            assert_eq!(failed, format!("127.0.0.1:{}", addr.port()))
        }
        Err(other) => panic!("expected bind error, got {}", other),
        Ok(_) => panic!("second bind on the same port succeeded"),
    }
}

#[tokio::test]
async fn test_transport_errors_go_to_on_error() {
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let config = MonitorConfig::new().on_error(move |e| {
        let _ = errors_tx.send(e.to_string());
    });
    let (_hub, monitor, addr) = start(config).await;

    let mut wire = JsonLinesSession::connect(addr).await.unwrap();
    recv(&mut wire).await;
    wire.send(WireMessage::password("")).await.unwrap();
    recv(&mut wire).await;

    // A second peer speaking garbage only takes itself down
    let mut raw = TcpStream::connect(addr).await.unwrap();
    raw.write_all(b"not json\n").await.unwrap();

    let reported = timeout(WAIT, errors_rx.recv()).await.unwrap().unwrap();
    assert!(reported.starts_with("serialization error"), "{}", reported);
    assert_eq!(monitor.roster().len(), 1);

    monitor.adapter().add("s1", "lobby").unwrap();
    assert_eq!(recv(&mut wire).await.unwrap().name, "join");
}

#[tokio::test]
async fn test_closed_listener_refuses_connections() {
    let (_hub, monitor, addr) = start(MonitorConfig::new()).await;
    let listener = monitor.listener().unwrap();

    listener.close().await;
    listener.close().await;

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_capture_only_without_server() {
    let hub = Arc::new(MemoryAdapter::new());
    let monitor = Monitor::attach(hub.clone(), MonitorConfig::new().no_server())
        .await
        .unwrap();

    let (server_end, client_end) = hubmon::server::ChannelSession::pair();
    monitor.accept(server_end);

    let mut client = MonitorClient::handshake(client_end, None).await.unwrap();
    client.next_init().await.unwrap();

    let conn = monitor.on_connection(hub.connect("s1"));
    let event = timeout(WAIT, client.next_event()).await.unwrap().unwrap();
    assert_eq!(event, Some(CanonicalEvent::connect("s1")));
    drop(conn);
}

#[tokio::test]
async fn test_hub_side_disconnect_reaches_feed() {
    let (hub, monitor, addr) = start(MonitorConfig::new()).await;

    let mut client = MonitorClient::connect(addr, None).await.unwrap();
    client.next_init().await.unwrap();

    // Nobody calls `disconnected()`; the hub closing the connection is enough
    let conn = monitor.on_connection(hub.connect("s1"));
    hub.disconnect("s1");

    for expected in [CanonicalEvent::connect("s1"), CanonicalEvent::disconnect("s1")] {
        let event = timeout(WAIT, client.next_event()).await.unwrap().unwrap();
        assert_eq!(event, Some(expected));
    }

    // Dropping the wrapper afterwards publishes nothing more
    drop(conn);
    monitor.events().publish(CanonicalEvent::connect("marker"));
    let event = timeout(WAIT, client.next_event()).await.unwrap().unwrap();
    assert_eq!(event, Some(CanonicalEvent::connect("marker")));
}

#[tokio::test]
async fn test_shutdown_mid_handshake_leaves_no_session() {
    let (_hub, monitor, addr) = start(MonitorConfig::new()).await;

    let mut wire = JsonLinesSession::connect(addr).await.unwrap();
    assert_eq!(recv(&mut wire).await, Some(WireMessage::req_auth(false)));

    monitor.shutdown().await;
    // The server may already have hung up
    let _ = wire.send(WireMessage::password("")).await;

    // Either a clean close or a reset, but never an init
    let end = timeout(WAIT, wire.recv()).await.expect("connection left open");
    assert!(!matches!(end, Some(Ok(_))), "unexpected message {:?}", end);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(monitor.roster().is_empty());
}
