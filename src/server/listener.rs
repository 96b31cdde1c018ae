//! Control channel listener and per-connection driver
//!
//! Each accepted connection runs the auth handshake, is admitted to the
//! roster, receives its `init` snapshot, and then relays dispatched events
//! until either side goes away.

use crate::auth::{AuthState, Handshake, HandshakeAction, HandshakeInput, Password};
use crate::error::MonitorError;
use crate::events::EventHub;
use crate::monitor::ErrorCallback;
use crate::server::roster::Roster;
use crate::server::session::Session;
use crate::server::wire::{JsonLinesSession, WireMessage, WireSession};
use crate::snapshot::StateSnapshot;
use parking_lot::Mutex;
use std::future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Buffered attach notifications per subscriber
const ATTACHED_CAPACITY: usize = 64;

/// A session received its initial snapshot
#[derive(Debug, Clone)]
pub struct ClientAttached {
    pub session_id: Uuid,
    pub peer: String,
    pub snapshot: StateSnapshot,
}

/// Everything a connection driver needs, shared by all connections
#[derive(Clone)]
pub struct ListenerContext {
    pub events: Arc<EventHub>,
    pub roster: Arc<Roster>,
    pub password: Option<Password>,
    pub auth_timeout: Duration,
    pub on_error: Option<ErrorCallback>,
    pub attached: broadcast::Sender<ClientAttached>,
    /// Cancelled when the monitor shuts down; ends handshakes and relays
    pub shutdown: CancellationToken,
}

impl ListenerContext {
    pub fn new(events: Arc<EventHub>, roster: Arc<Roster>) -> Self {
        let (attached, _) = broadcast::channel(ATTACHED_CAPACITY);
        Self {
            events,
            roster,
            password: None,
            auth_timeout: Duration::from_millis(1500),
            on_error: None,
            attached,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_password(mut self, password: Option<Password>) -> Self {
        self.password = password;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_on_error(mut self, on_error: Option<ErrorCallback>) -> Self {
        self.on_error = on_error;
        self
    }

    /// Route a failure to the error callback, or the log when none is set
    pub fn report(&self, error: MonitorError) {
        if error.is_expected() {
            debug!(error = %error, "Connection ended");
            return;
        }

        match &self.on_error {
            Some(on_error) => on_error(&error),
            None => warn!(error = %error, "Monitor connection error"),
        }
    }

    pub fn subscribe_attached(&self) -> broadcast::Receiver<ClientAttached> {
        self.attached.subscribe()
    }

    /// End every connection this context drives, admitted or not
    pub fn shut_down(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A bound, accepting listener
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    attached: broadcast::Sender<ClientAttached>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Sessions already admitted are unaffected.
    pub async fn close(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.lock().is_none()
    }

    /// Notifications for each client that received its `init`
    pub fn attached(&self) -> broadcast::Receiver<ClientAttached> {
        self.attached.subscribe()
    }
}

/// Bind `addr` and start accepting monitor clients
pub async fn listen(addr: &str, ctx: ListenerContext) -> Result<ListenerHandle, MonitorError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| MonitorError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    info!(addr = %local_addr, "Monitor listening");

    let attached = ctx.attached.clone();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(accept_loop(listener, Arc::new(ctx), shutdown_rx));

    Ok(ListenerHandle {
        local_addr,
        shutdown: Mutex::new(Some(shutdown_tx)),
        task: Mutex::new(Some(task)),
        attached,
    })
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Monitor listener closed");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    debug!(peer = %peer, "Monitor client connected");

                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        serve_connection(JsonLinesSession::new(stream), ctx).await;
                    });
                }
                Err(e) => ctx.report(MonitorError::Io(e)),
            }
        }
    }
}

/// Drive one connection from handshake to close
pub async fn serve_connection<W: WireSession>(mut wire: W, ctx: Arc<ListenerContext>) {
    let peer = wire.peer();

    if ctx.is_shut_down() {
        debug!(peer = %peer, "Monitor shut down, refusing connection");
        wire.close().await;
        return;
    }

    match authenticate(&mut wire, &ctx).await {
        Ok(true) => {}
        Ok(false) => {
            wire.close().await;
            return;
        }
        Err(e) => {
            ctx.report(e);
            wire.close().await;
            return;
        }
    }

    let (session, mut outbound) = Session::channel(peer.clone());
    let session = Arc::new(session);
    let session_id = session.id();
    ctx.roster.admit(session.clone());

    // Shutdown may have swept the roster while we were authenticating
    if ctx.is_shut_down() {
        ctx.roster.retire(session_id);
        wire.close().await;
        debug!(peer = %peer, "Monitor shut down during handshake");
        return;
    }

    info!(session_id = %session_id, peer = %peer, "Monitor client authorized");

    schedule_init(session, ctx.clone());

    let result = relay(&mut wire, &mut outbound, &ctx.shutdown).await;

    ctx.roster.retire(session_id);
    wire.close().await;

    info!(session_id = %session_id, peer = %peer, "Monitor client disconnected");

    if let Err(e) = result {
        ctx.report(e);
    }
}

/// Run the handshake. Ok(false) means the peer was turned away.
async fn authenticate<W: WireSession>(
    wire: &mut W,
    ctx: &ListenerContext,
) -> Result<bool, MonitorError> {
    let (mut handshake, mut actions) = Handshake::start(ctx.password.clone());
    let mut deadline: Option<Pin<Box<Sleep>>> = None;

    loop {
        for action in actions.drain(..) {
            match action {
                HandshakeAction::SendReqAuth(required) => {
                    wire.send(WireMessage::req_auth(required)).await?
                }
                HandshakeAction::StartTimer => deadline = Some(Box::pin(sleep(ctx.auth_timeout))),
                HandshakeAction::CancelTimer => deadline = None,
                HandshakeAction::SendAuth {
                    error: Some(failure),
                    ..
                } => wire.send(WireMessage::auth_failed(failure)).await?,
                HandshakeAction::SendAuth { .. } => wire.send(WireMessage::auth_ok()).await?,
                // The caller owns closing and admission
                HandshakeAction::Close | HandshakeAction::Admit => {}
            }
        }

        match handshake.state() {
            AuthState::AwaitingPassword => {}
            AuthState::Authorized => return Ok(true),
            AuthState::Rejected(failure) => {
                info!(peer = %wire.peer(), reason = %failure, "Monitor client rejected");
                return Ok(false);
            }
            AuthState::Abandoned => {
                debug!(peer = %wire.peer(), "Monitor client left during handshake");
                return Ok(false);
            }
        }

        let input = tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                debug!(peer = %wire.peer(), "Monitor shut down during handshake");
                return Ok(false);
            }
            _ = expire(&mut deadline) => Some(HandshakeInput::TimerFired),
            inbound = wire.recv() => match inbound {
                Some(Ok(msg)) if msg.name == "password" => {
                    let given = msg.data.as_str().unwrap_or_default().to_string();
                    Some(HandshakeInput::Password(given))
                }
                Some(Ok(msg)) => {
                    debug!(peer = %wire.peer(), name = %msg.name, "Ignoring message before auth");
                    None
                }
                Some(Err(e)) => return Err(e),
                None => Some(HandshakeInput::PeerClosed),
            }
        };

        if let Some(input) = input {
            let (next, next_actions) = handshake.step(input);
            handshake = next;
            actions = next_actions;
        }
    }
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(timer) => timer.await,
        None => future::pending().await,
    }
}

/// Send the current state to a freshly admitted session
///
/// Runs on its own task after yielding once, so the admission that
/// triggered it has fully completed first.
fn schedule_init(session: Arc<Session>, ctx: Arc<ListenerContext>) {
    tokio::spawn(async move {
        tokio::task::yield_now().await;

        let built = match ctx.events.snapshot().await {
            Ok(snapshot) => WireMessage::init(&snapshot).map(|msg| (snapshot, msg)),
            Err(e) => Err(e),
        };

        match built {
            Ok((snapshot, msg)) => {
                if session.send(msg).await.is_err() {
                    debug!(session_id = %session.id(), "Session closed before init");
                    return;
                }
                let _ = ctx.attached.send(ClientAttached {
                    session_id: session.id(),
                    peer: session.peer().to_string(),
                    snapshot,
                });
            }
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "Failed to build snapshot");
                let _ = session.send(WireMessage::error(e.to_string())).await;
            }
        }
    });
}

/// Forward queued events to the peer until either side closes
async fn relay<W: WireSession>(
    wire: &mut W,
    outbound: &mut mpsc::Receiver<WireMessage>,
    shutdown: &CancellationToken,
) -> Result<(), MonitorError> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            queued = outbound.recv() => match queued {
                Some(msg) => wire.send(msg).await?,
                // Retired
                None => return Ok(()),
            },
            inbound = wire.recv() => match inbound {
                Some(Ok(msg)) => {
                    debug!(peer = %wire.peer(), name = %msg.name, "Ignoring message from monitor client");
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}
