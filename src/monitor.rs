//! Wiring between a hub and its monitor clients

use crate::auth::Password;
use crate::error::MonitorError;
use crate::events::{CanonicalEvent, EventHub, SubscriptionId};
use crate::hub::{Adapter, Connection};
use crate::intercept::{MonitoredAdapter, MonitoredConnection};
use crate::server::{
    listen, serve_connection, ClientAttached, Dispatcher, ListenerContext, ListenerHandle, Roster,
    WireSession,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Receives out-of-band connection errors
pub type ErrorCallback = Arc<dyn Fn(&MonitorError) + Send + Sync>;

pub const DEFAULT_PORT: u16 = 9042;
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_millis(1500);

/// Monitor settings
#[derive(Clone)]
pub struct MonitorConfig {
    /// Start the TCP listener. When false the caller hands connections to
    /// [`Monitor::accept`] itself.
    pub server: bool,
    pub port: u16,
    pub host: String,
    /// `None` admits every client without a password
    pub password: Option<Password>,
    /// How long a client has to answer `reqAuth(true)`
    pub auth_timeout: Duration,
    pub on_error: Option<ErrorCallback>,
    /// Log every canonical event at debug level
    pub debug: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            server: true,
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            password: None,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
            on_error: None,
            debug: false,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `HUBMON_PORT`, `HUBMON_HOST`, `HUBMON_PASSWORD`
    /// and `HUBMON_AUTH_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, MonitorError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `var`
    pub fn from_vars<F>(var: F) -> Result<Self, MonitorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = var("HUBMON_PORT") {
            config.port = port
                .parse()
                .map_err(|_| MonitorError::Config(format!("HUBMON_PORT: invalid port {:?}", port)))?;
        }
        if let Some(host) = var("HUBMON_HOST") {
            config.host = host;
        }
        config.password = var("HUBMON_PASSWORD").and_then(Password::new);
        if let Some(ms) = var("HUBMON_AUTH_TIMEOUT_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                MonitorError::Config(format!("HUBMON_AUTH_TIMEOUT_MS: invalid value {:?}", ms))
            })?;
            config.auth_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Wire up capture and dispatch only
    pub fn no_server(mut self) -> Self {
        self.server = false;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Require this secret. An empty string leaves auth disabled.
    pub fn password(mut self, secret: impl Into<String>) -> Self {
        self.password = Password::new(secret);
        self
    }

    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&MonitorError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for MonitorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("host", &self.host)
            .field("password", &self.password)
            .field("auth_timeout", &self.auth_timeout)
            .field("on_error", &self.on_error.as_ref().map(|_| "<callback>"))
            .field("debug", &self.debug)
            .finish()
    }
}

/// A hub with monitoring attached
///
/// Route all membership changes and broadcasts through [`adapter`](Self::adapter)
/// and wrap each new hub connection with [`on_connection`](Self::on_connection).
pub struct Monitor<A: Adapter> {
    adapter: Arc<MonitoredAdapter<A>>,
    events: Arc<EventHub>,
    roster: Arc<Roster>,
    dispatcher: Dispatcher,
    context: Arc<ListenerContext>,
    listener: Option<ListenerHandle>,
    tap: Mutex<Vec<SubscriptionId>>,
    config: MonitorConfig,
}

impl<A: Adapter + 'static> Monitor<A> {
    /// Wire capture and dispatch, then bind the listener if `config.server`
    pub async fn attach(adapter: Arc<A>, config: MonitorConfig) -> Result<Self, MonitorError> {
        let mut monitor = Self::new(adapter, config);
        if monitor.config.server {
            monitor.start_listener().await?;
        }
        Ok(monitor)
    }

    /// Wire capture and dispatch without touching the network
    pub fn new(adapter: Arc<A>, config: MonitorConfig) -> Self {
        let events = Arc::new(EventHub::new(adapter.clone()));
        let adapter = Arc::new(MonitoredAdapter::new(adapter, events.clone()));
        let roster = Arc::new(Roster::new());
        let dispatcher = Dispatcher::start(events.clone(), roster.clone());

        let tap = if config.debug {
            events.subscribe_all(Arc::new(|event: &CanonicalEvent| {
                debug!(target: "hubmon::tap", kind = %event.kind(), event = ?event, "Hub event");
            }))
        } else {
            Vec::new()
        };

        let context = Arc::new(
            ListenerContext::new(events.clone(), roster.clone())
                .with_password(config.password.clone())
                .with_auth_timeout(config.auth_timeout)
                .with_on_error(config.on_error.clone()),
        );

        Self {
            adapter,
            events,
            roster,
            dispatcher,
            context,
            listener: None,
            tap: Mutex::new(tap),
            config,
        }
    }

    /// Bind the configured address. A second call is a no-op.
    pub async fn start_listener(&mut self) -> Result<(), MonitorError> {
        if self.listener.is_some() {
            return Ok(());
        }

        let handle = listen(&self.config.bind_addr(), (*self.context).clone()).await?;
        info!(addr = %handle.local_addr(), auth = self.config.password.is_some(), "Monitor attached");
        self.listener = Some(handle);
        Ok(())
    }

    /// The instrumented adapter; use it in place of the raw one
    pub fn adapter(&self) -> &Arc<MonitoredAdapter<A>> {
        &self.adapter
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn listener(&self) -> Option<&ListenerHandle> {
        self.listener.as_ref()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Instrument a new hub connection; publishes `connect`
    pub fn on_connection<C: Connection>(&self, conn: C) -> MonitoredConnection<C> {
        MonitoredConnection::new(conn, self.events.clone())
    }

    /// Serve a caller-owned connection, handshake included
    pub fn accept<W: WireSession + 'static>(&self, wire: W) -> JoinHandle<()> {
        tokio::spawn(serve_connection(wire, self.context.clone()))
    }

    /// Attach notifications, available with or without the listener
    pub fn attached(&self) -> broadcast::Receiver<ClientAttached> {
        self.context.subscribe_attached()
    }

    /// Stop listening and dispatching, and end every connection, including
    /// ones still in the handshake
    pub async fn shutdown(&self) {
        self.context.shut_down();

        if let Some(listener) = &self.listener {
            listener.close().await;
        }

        self.dispatcher.stop();
        for id in self.tap.lock().drain(..) {
            self.events.unsubscribe(id);
        }

        for session in self.roster.sessions() {
            self.roster.retire(session.id());
        }

        info!("Monitor shut down");
    }
}
