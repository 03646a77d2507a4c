//! # Server
//!
//! Accepts inbound sockets, gives each one its own copy of the protocol template,
//! and keeps a registry of live connections for broadcast.
//!
//! ## Accept path
//! The accept loop never waits on a handshake. Each accepted socket gets a task
//! that runs the protocol's accept handshake, fires the connect observers, and
//! registers the connection only if it is still connected after those observers
//! ran. Messages start flowing once the connection is registered.
//!
//! ## Example
//! ```rust,no_run
//! use framelink::service::Server;
//! use framelink::transport::TcpProtocol;
//!
//! # async fn run() -> framelink::error::Result<()> {
//! let server = Server::new(TcpProtocol::prefix_length());
//! server.on_message(|message| {
//!     if let Some(connection) = message.connection() {
//!         tokio::spawn({
//!             let payload = message.payload().clone();
//!             async move { connection.send(payload).await }
//!         });
//!     }
//!     Ok(())
//! });
//! let addr = server.start("127.0.0.1:9000").await?;
//! println!("listening on {addr}");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::config::ServerConfig;
use crate::core::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::service::connection::Connection;
use crate::service::events::{
    invoke_handler, notify, ConnectObserver, DisconnectObserver, DisconnectReason, ErrorObserver,
    HandlerResult, MessageObserver, Observers, Supervisor,
};
use crate::transport::Protocol;
use crate::utils::metrics::{Metrics, Timer};

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Outcome of a broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was written to
    pub delivered: usize,
    /// Connections whose send failed
    pub failed: usize,
}

/// Listening server. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    protocol: Box<dyn Protocol>,
    config: ServerConfig,
    metrics: Arc<Metrics>,
    connections: Mutex<HashMap<u64, Connection>>,
    /// Accepted sockets still in their handshake or connect observers
    pending: AtomicUsize,
    listening: Mutex<Option<Listening>>,
    on_connect: Observers<ConnectObserver>,
    on_disconnect: Observers<DisconnectObserver>,
    on_message: Observers<MessageObserver>,
    on_error: Observers<ErrorObserver>,
}

struct Listening {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Server {
    /// Server with the default [`ServerConfig`].
    pub fn new(protocol: impl Protocol) -> Self {
        Self::with_config(protocol, ServerConfig::default())
    }

    /// Server using the limits and timeouts in `config`. `protocol` is the
    /// template each accepted connection gets a fresh copy of.
    pub fn with_config(protocol: impl Protocol, config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                protocol: Box::new(protocol),
                config,
                metrics: Arc::new(Metrics::new()),
                connections: Mutex::new(HashMap::new()),
                pending: AtomicUsize::new(0),
                listening: Mutex::new(None),
                on_connect: Observers::new(),
                on_disconnect: Observers::new(),
                on_message: Observers::new(),
                on_error: Observers::new(),
            }),
        }
    }

    /// Bind `address` and start accepting. Returns the bound address, which
    /// differs from `address` when it asks for port 0.
    #[instrument(skip(self), fields(protocol = self.inner.protocol.name()))]
    pub async fn start(&self, address: &str) -> Result<SocketAddr> {
        if address.trim().is_empty() {
            return Err(ProtocolError::InvalidArgument(constants::ERR_EMPTY_ADDRESS.into()));
        }
        if self.is_running() {
            return Err(ProtocolError::AlreadyRunning);
        }

        let addr = lookup_host(address)
            .await?
            .next()
            .ok_or_else(|| ProtocolError::InvalidArgument(format!("{address} did not resolve")))?;
        let listener = self.bind(addr)?;
        let local_addr = listener.local_addr()?;

        let mut listening = lock(&self.inner.listening);
        if listening.is_some() {
            return Err(ProtocolError::AlreadyRunning);
        }
        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(accept_loop(
            Arc::downgrade(&self.inner),
            listener,
            shutdown.clone(),
            tasks.clone(),
        ));
        *listening = Some(Listening {
            local_addr,
            shutdown,
            tasks,
        });
        drop(listening);

        info!(address = %local_addr, "Server listening");
        Ok(local_addr)
    }

    /// [`start`](Self::start) on the address in this server's [`ServerConfig`].
    pub async fn start_configured(&self) -> Result<SocketAddr> {
        let address = self.inner.config.address.clone();
        self.start(&address).await
    }

    fn bind(&self, addr: SocketAddr) -> Result<TcpListener> {
        let socket = self.inner.protocol.socket(&addr)?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.inner.config.backlog)?)
    }

    /// Stop accepting. Live connections stay open.
    pub async fn stop(&self) -> Result<()> {
        let listening = lock(&self.inner.listening)
            .take()
            .ok_or(ProtocolError::NotRunning)?;
        let _timer = Timer::start("server_stop");

        listening.shutdown.cancel();
        listening.tasks.close();
        let grace = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(grace, listening.tasks.wait()).await.is_err() {
            warn!(
                timeout_ms = grace.as_millis() as u64,
                "Pending handshakes did not finish before the shutdown timeout"
            );
        }

        info!(address = %listening.local_addr, "Server stopped");
        Ok(())
    }

    /// Stop accepting and dispose every live connection. Each connection's
    /// disconnect notification still fires.
    pub async fn dispose(&self) {
        if let Err(e) = self.stop().await {
            debug!(error = %e, "Server was not running");
        }

        let live = self.connections();
        for connection in &live {
            connection.dispose();
        }
        lock(&self.inner.connections).clear();
        info!(disposed = live.len(), "Server disposed");
        self.inner.metrics.log_metrics();
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        lock(&self.inner.listening).is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.listening)
            .as_ref()
            .map(|listening| listening.local_addr)
    }

    /// Snapshot of the live connections, ordered by id.
    pub fn connections(&self) -> Vec<Connection> {
        let mut live: Vec<Connection> = lock(&self.inner.connections).values().cloned().collect();
        live.sort_by_key(Connection::id);
        live
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections).len()
    }

    /// Counters shared by this server and every connection it accepted.
    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Send one payload to every live connection.
    pub async fn broadcast(&self, payload: impl AsRef<[u8]>) -> BroadcastReport {
        self.broadcast_parts(&[payload.as_ref()]).await
    }

    /// Send one frame built from `parts` to every live connection.
    ///
    /// Works on a snapshot of the registry and sends concurrently; a failing peer
    /// only shows up in [`BroadcastReport::failed`].
    pub async fn broadcast_parts(&self, parts: &[&[u8]]) -> BroadcastReport {
        let targets = self.connections();
        let results = join_all(targets.iter().map(|connection| connection.send_parts(parts))).await;

        let mut report = BroadcastReport::default();
        for (connection, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    debug!(conn_id = connection.id(), error = %e, "Broadcast send failed");
                }
            }
        }
        report
    }

    /// Observe connections after their handshake. An observer may dispose the
    /// connection to reject it; it is then never registered.
    pub fn on_connect<F>(&self, observer: F)
    where
        F: Fn(&Connection) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.on_connect.push(Arc::new(observer));
    }

    /// Observe registered connections ending. The connection has already left
    /// the registry when this fires.
    pub fn on_disconnect<F>(&self, observer: F)
    where
        F: Fn(&Connection, &DisconnectReason) + Send + Sync + 'static,
    {
        self.inner.on_disconnect.push(Arc::new(observer));
    }

    /// Observe messages from every connection that uses its default handler.
    pub fn on_message<F>(&self, observer: F)
    where
        F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.on_message.push(Arc::new(observer));
    }

    /// Observe handler failures and protocol violations on any connection.
    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&Connection, &ProtocolError) + Send + Sync + 'static,
    {
        self.inner.on_error.push(Arc::new(observer));
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("protocol", &self.inner.protocol.name())
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ServerInner {
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, shutdown: &CancellationToken, tasks: &TaskTracker) {
        let live = lock(&self.connections).len() + self.pending.load(Ordering::Acquire);
        if live >= self.config.max_connections {
            warn!(%peer, limit = self.config.max_connections, "Connection limit reached; refusing");
            self.metrics.connection_error();
            return;
        }

        let supervisor: Weak<dyn Supervisor> = Arc::downgrade(self) as Weak<dyn Supervisor>;
        let connection = Connection::accepted(
            self.protocol.box_clone(),
            self.config.handshake_timeout,
            Arc::clone(&self.metrics),
            supervisor,
        );

        let span = tracing::info_span!("accept", conn_id = connection.id(), %peer);
        let slot = PendingAccept::new(self);
        let shutdown = shutdown.clone();
        tasks.spawn(
            async move { slot.0.complete_accept(connection, stream, shutdown).await }.instrument(span),
        );
    }

    async fn complete_accept(&self, connection: Connection, stream: TcpStream, shutdown: CancellationToken) {
        if !connection.accept_stream(stream).await {
            return;
        }

        for observer in self.on_connect.snapshot() {
            if let Err(e) = invoke_handler(|| observer(&connection)) {
                if !connection.report_error(&e) {
                    error!(error = %e, "Unobserved connect handler error; closing connection");
                    connection.disconnect(DisconnectReason::HandlerError(e.to_string()));
                }
            }
        }

        let registered = {
            let mut registry = lock(&self.connections);
            let keep = connection.is_connected() && !shutdown.is_cancelled();
            if keep {
                registry.insert(connection.id(), connection.clone());
            }
            keep
        };

        if !registered {
            if connection.is_connected() {
                debug!("Server stopped during handshake");
                connection.dispose();
            } else {
                debug!("Connection closed by connect handler");
            }
            return;
        }

        debug!(connections = self.connections_len(), "Connection registered");
        connection.ensure_receive_loop_running();
    }

    fn connections_len(&self) -> usize {
        lock(&self.connections).len()
    }
}

/// Holds a place under `max_connections` for an accepted socket until its
/// accept task ends, whichever way it ends.
struct PendingAccept(Arc<ServerInner>);

impl PendingAccept {
    fn new(server: &Arc<ServerInner>) -> Self {
        server.pending.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(server))
    }
}

impl Drop for PendingAccept {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Supervisor for ServerInner {
    fn on_message(&self, message: &Message) -> HandlerResult {
        for observer in self.on_message.snapshot() {
            observer(message)?;
        }
        Ok(())
    }

    fn on_error(&self, connection: &Connection, error: &ProtocolError) -> bool {
        let observers = self.on_error.snapshot();
        for observer in &observers {
            notify("server_on_error", || observer(connection, error));
        }
        !observers.is_empty()
    }

    fn on_disconnect(&self, connection: &Connection, reason: &DisconnectReason) {
        if lock(&self.connections).remove(&connection.id()).is_none() {
            return;
        }
        for observer in self.on_disconnect.snapshot() {
            notify("server_on_disconnect", || observer(connection, reason));
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let listening = self
            .listening
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listening) = listening {
            listening.shutdown.cancel();
        }
    }
}

/// Accept until `shutdown` fires or the server is dropped. Accept errors back
/// off exponentially and never end the loop.
async fn accept_loop(
    server: Weak<ServerInner>,
    listener: TcpListener,
    shutdown: CancellationToken,
    tasks: TaskTracker,
) {
    let mut backoff = ACCEPT_BACKOFF_INITIAL;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                backoff = ACCEPT_BACKOFF_INITIAL;
                let Some(server) = server.upgrade() else { break };
                debug!(%peer, "Accepted connection");
                server.admit(stream, peer, &shutdown, &tasks);
            }
            Err(e) => {
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Accept failed");
                if let Some(server) = server.upgrade() {
                    server.metrics.connection_error();
                }
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
            }
        }
    }

    info!("Accept loop stopped");
}
