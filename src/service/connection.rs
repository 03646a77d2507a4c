//! # Connection
//!
//! One endpoint of a framed TCP conversation. A `Connection` is a cheap handle:
//! clones share the same socket, protocol, session map and observers.
//!
//! ## Lifecycle
//! ```text
//! Idle -> Connecting -> Connected -> Disconnected
//! ```
//! `Disconnected` is terminal. A connection is never reconnected; build a new one
//! to retry. Whatever ends a connected session (a local `dispose`, the peer
//! closing, a protocol violation, a transport failure, an unobserved handler
//! error) goes through one disconnect path, and the disconnect notification fires
//! exactly once.
//!
//! ## Example
//! ```rust,no_run
//! use framelink::service::Connection;
//! use framelink::transport::TcpProtocol;
//!
//! # async fn run() -> framelink::error::Result<()> {
//! let connection = Connection::new(TcpProtocol::prefix_length());
//! connection.on_message(|message| {
//!     println!("received {} bytes", message.len());
//!     Ok(())
//! });
//!
//! if connection.connect("127.0.0.1:9000").await? {
//!     connection.send(b"hello").await?;
//! }
//! connection.dispose();
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::ClientConfig;
use crate::core::Message;
use crate::error::{constants, ProtocolError, Result};
use crate::service::events::{
    invoke_handler, notify, DisconnectObserver, DisconnectReason, ErrorObserver, HandlerResult,
    MessageObserver, Observers, ReceiveHandler, SendObserver, Supervisor,
};
use crate::transport::{engine, BoxedStream, Protocol, Role};
use crate::utils::metrics::{global_metrics, Metrics};
use crate::utils::timeout::with_timeout_error;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type SessionMap = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, `connect` not yet called
    Idle,
    /// TCP connect or handshake in progress
    Connecting,
    /// Transport established; sends allowed
    Connected,
    /// Terminal
    Disconnected,
}

/// Handle to one framed TCP conversation.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

/// Non-owning reference held by messages.
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

struct ConnectionInner {
    id: u64,
    protocol: Box<dyn Protocol>,
    config: ClientConfig,
    metrics: Arc<Metrics>,
    state: Mutex<ConnectionState>,
    /// Set once by the first disconnect
    closed: AtomicBool,
    receiving: AtomicBool,
    shutdown: CancellationToken,
    writer: AsyncMutex<Option<WriteHalf<BoxedStream>>>,
    /// Parked here between attach and the start of the receive loop
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    peer_addr: OnceLock<SocketAddr>,
    local_addr: OnceLock<SocketAddr>,
    session: OnceLock<Mutex<SessionMap>>,
    receive_handler: RwLock<Option<ReceiveHandler>>,
    on_message: Observers<MessageObserver>,
    on_disconnect: Observers<DisconnectObserver>,
    on_error: Observers<ErrorObserver>,
    on_send: Observers<SendObserver>,
    supervisor: OnceLock<Weak<dyn Supervisor>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reject an empty address or a literal zero port before any I/O happens.
fn validate_endpoint(address: &str) -> Result<()> {
    if address.trim().is_empty() {
        return Err(ProtocolError::InvalidArgument(constants::ERR_EMPTY_ADDRESS.into()));
    }
    let port = address
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse::<u16>().ok())
        .ok_or_else(|| ProtocolError::InvalidArgument(format!("Missing or invalid port in {address}")))?;
    if port == 0 {
        return Err(ProtocolError::InvalidArgument(constants::ERR_ZERO_PORT.into()));
    }
    Ok(())
}

impl Connection {
    /// Client connection with default timeouts.
    pub fn new(protocol: impl Protocol) -> Self {
        Self::with_config(protocol, ClientConfig::default())
    }

    /// Client connection using the timeouts in `config`.
    pub fn with_config(protocol: impl Protocol, config: ClientConfig) -> Self {
        Self::build(Box::new(protocol), config, global_metrics())
    }

    /// Server-side connection for an accepted socket.
    pub(crate) fn accepted(
        protocol: Box<dyn Protocol>,
        handshake_timeout: Duration,
        metrics: Arc<Metrics>,
        supervisor: Weak<dyn Supervisor>,
    ) -> Self {
        let config = ClientConfig {
            handshake_timeout,
            ..ClientConfig::default()
        };
        let connection = Self::build(protocol, config, metrics);
        let _ = connection.inner.supervisor.set(supervisor);
        connection
    }

    fn build(protocol: Box<dyn Protocol>, config: ClientConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                protocol,
                config,
                metrics,
                state: Mutex::new(ConnectionState::Idle),
                closed: AtomicBool::new(false),
                receiving: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                writer: AsyncMutex::new(None),
                reader: Mutex::new(None),
                peer_addr: OnceLock::new(),
                local_addr: OnceLock::new(),
                session: OnceLock::new(),
                receive_handler: RwLock::new(None),
                on_message: Observers::new(),
                on_disconnect: Observers::new(),
                on_error: Observers::new(),
                on_send: Observers::new(),
                supervisor: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    /// Process-unique identifier.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// True only between a successful connect and the disconnect.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Remote address, once the TCP connect has succeeded.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr.get().copied()
    }

    /// Local address of the socket, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Name of the framing in use, e.g. `"prefix-length"`.
    pub fn protocol_name(&self) -> &'static str {
        self.inner.protocol.name()
    }

    /// Whether the stream runs over a negotiated secure channel.
    pub fn is_secure(&self) -> bool {
        self.inner.protocol.is_secure()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    /// Connect to `address` (`host:port`).
    ///
    /// Returns `Ok(false)` if the endpoint could not be reached within the
    /// connect timeout, refused the connection or failed the handshake. The
    /// connection is then terminal. Errors are reserved for misuse: an empty
    /// address, port zero, or a connection that is not idle.
    #[instrument(skip(self), fields(conn_id = self.id(), protocol = self.protocol_name()))]
    pub async fn connect(&self, address: &str) -> Result<bool> {
        validate_endpoint(address)?;
        self.begin_connecting()?;

        let tcp = match self.open_socket(address).await {
            Ok(tcp) => tcp,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                self.inner.metrics.connection_error();
                self.abandon();
                return Ok(false);
            }
        };

        if !self.establish(tcp, Role::Client).await {
            return Ok(false);
        }
        self.ensure_receive_loop_running();
        Ok(true)
    }

    /// Connect to the address in this connection's [`ClientConfig`].
    pub async fn connect_configured(&self) -> Result<bool> {
        let address = self.inner.config.address.clone();
        self.connect(&address).await
    }

    fn begin_connecting(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        match *state {
            ConnectionState::Idle => {
                *state = ConnectionState::Connecting;
                Ok(())
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                Err(ProtocolError::AlreadyConnected)
            }
            ConnectionState::Disconnected => Err(ProtocolError::InvalidArgument(
                "Connection has been disposed; create a new one to reconnect".into(),
            )),
        }
    }

    async fn open_socket(&self, address: &str) -> Result<TcpStream> {
        let attempt = async {
            let mut last_error = None;
            for addr in lookup_host(address).await? {
                let socket = self.inner.protocol.socket(&addr)?;
                match socket.connect(addr).await {
                    Ok(tcp) => return Ok(tcp),
                    Err(e) => {
                        debug!(%addr, error = %e, "Connect attempt failed");
                        last_error = Some(e);
                    }
                }
            }
            Err(ProtocolError::Io(last_error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{address} did not resolve"))
            })))
        };
        with_timeout_error(attempt, self.inner.config.connection_timeout).await
    }

    /// Server side: run the accept handshake on `tcp`.
    pub(crate) async fn accept_stream(&self, tcp: TcpStream) -> bool {
        if self.begin_connecting().is_err() {
            return false;
        }
        self.establish(tcp, Role::Server).await
    }

    /// Handshake, then attach the resulting stream. On failure the connection is
    /// left terminal without a disconnect notification.
    async fn establish(&self, tcp: TcpStream, role: Role) -> bool {
        if let Ok(peer) = tcp.peer_addr() {
            let _ = self.inner.peer_addr.set(peer);
        }
        if let Ok(local) = tcp.local_addr() {
            let _ = self.inner.local_addr.set(local);
        }

        let secure = self.is_secure();
        if secure {
            self.inner.metrics.handshake_attempt();
        }

        let protocol = &self.inner.protocol;
        let handshake = async {
            match role {
                Role::Client => protocol.on_connect(tcp).await,
                Role::Server => protocol.on_accepted_by_server(tcp).await,
            }
        };

        match with_timeout_error(handshake, self.inner.config.handshake_timeout).await {
            Ok(stream) => {
                if secure {
                    self.inner.metrics.handshake_success();
                }
                self.attach(stream).await
            }
            Err(e) => {
                if secure {
                    self.inner.metrics.handshake_failed();
                } else {
                    self.inner.metrics.connection_error();
                }
                warn!(conn_id = self.id(), ?role, error = %e, "Handshake failed");
                self.abandon();
                false
            }
        }
    }

    async fn attach(&self, stream: BoxedStream) -> bool {
        let (reader, writer) = tokio::io::split(stream);
        *self.inner.writer.lock().await = Some(writer);
        *lock(&self.inner.reader) = Some(reader);

        {
            let mut state = lock(&self.inner.state);
            if self.inner.closed.load(Ordering::Acquire) || *state != ConnectionState::Connecting {
                drop(state);
                debug!(conn_id = self.id(), "Disposed during connect");
                self.release_stream();
                return false;
            }
            *state = ConnectionState::Connected;
        }

        self.inner.metrics.connection_established();
        info!(
            conn_id = self.id(),
            peer = ?self.peer_addr(),
            protocol = self.protocol_name(),
            "Connection established"
        );
        true
    }

    /// Failed before reaching `Connected`.
    fn abandon(&self) {
        self.inner.closed.store(true, Ordering::Release);
        *lock(&self.inner.state) = ConnectionState::Disconnected;
        self.inner.shutdown.cancel();
        self.release_stream();
    }

    fn release_stream(&self) {
        lock(&self.inner.reader).take();
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        } else if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            // A send holds the writer; close it once that send lets go.
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move {
                inner.writer.lock().await.take();
            });
        }
    }

    /// Start the receive loop unless it is already running.
    ///
    /// Reads are issued one at a time and each frame is dispatched before the next
    /// read, so messages arrive in wire order. No-op before the connection is
    /// established.
    pub fn ensure_receive_loop_running(&self) {
        if self.inner.receiving.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(reader) = lock(&self.inner.reader).take() else {
            self.inner.receiving.store(false, Ordering::Release);
            return;
        };
        tokio::spawn(engine::receive_loop(
            self.clone(),
            reader,
            self.inner.protocol.new_decoder(),
            self.inner.shutdown.clone(),
        ));
    }

    /// Frame and send one payload.
    pub async fn send(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        self.send_parts(&[payload.as_ref()]).await
    }

    /// Concatenate `parts` into one frame and send it.
    ///
    /// Concurrent sends never interleave bytes within a frame, but their relative
    /// order is whatever order they acquire the writer in.
    pub async fn send_parts(&self, parts: &[&[u8]]) -> Result<()> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }

        let mut frame = BytesMut::new();
        let length = self.inner.protocol.encode_frame(parts, &mut frame)?;
        self.write_wire(&frame).await?;

        self.inner.metrics.message_sent(length as u64);
        trace!(conn_id = self.id(), bytes = length, "Frame sent");
        for observer in self.inner.on_send.snapshot() {
            notify("on_send", || observer(self, length));
        }
        Ok(())
    }

    /// Write `bytes` to the stream as-is, bypassing the framing.
    pub async fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        self.write_wire(bytes).await
    }

    async fn write_wire(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(ProtocolError::NotConnected)?;

        match engine::write_frame(writer, bytes, &self.inner.shutdown).await {
            Ok(()) => {
                drop(guard);
                // A dispose racing this send may have found the lock held.
                if self.inner.shutdown.is_cancelled() {
                    self.inner.writer.lock().await.take();
                }
                Ok(())
            }
            Err(e) => {
                guard.take();
                drop(guard);
                if !self.inner.shutdown.is_cancelled() {
                    self.inner.metrics.connection_error();
                    self.disconnect(engine::transport_reason(&e));
                }
                Err(ProtocolError::ConnectionClosed)
            }
        }
    }

    /// Send `payload` and wait for the next message from the peer.
    ///
    /// The receive handler is substituted for the duration of the call and put
    /// back afterwards, so the reply is not delivered to the message observers.
    pub async fn send_and_wait(&self, payload: impl AsRef<[u8]>, timeout: Duration) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        let reply = Mutex::new(Some(tx));
        let owner = self.downgrade();

        let previous = self.set_receive_handler(move |message: Message| {
            if let Some(tx) = lock(&reply).take() {
                let _ = tx.send(message);
                return Ok(());
            }
            match owner.upgrade() {
                Some(connection) => connection.default_dispatch(&message),
                None => Ok(()),
            }
        });

        let result = async {
            self.send(payload).await?;
            with_timeout_error(
                async { rx.await.map_err(|_| ProtocolError::ConnectionClosed) },
                timeout,
            )
            .await
        }
        .await;

        self.swap_handler(previous);
        result
    }

    /// [`send_and_wait`](Self::send_and_wait) with the configured response timeout.
    pub async fn request(&self, payload: impl AsRef<[u8]>) -> Result<Message> {
        self.send_and_wait(payload, self.inner.config.response_timeout)
            .await
    }

    /// Replace the receive handler. Returns the handler that was installed, if any.
    ///
    /// While a custom handler is installed, messages are not forwarded to the
    /// `on_message` observers or to a server.
    pub fn set_receive_handler<F>(&self, handler: F) -> Option<ReceiveHandler>
    where
        F: Fn(Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.swap_handler(Some(Arc::new(handler)))
    }

    /// Go back to forwarding messages to the observers.
    pub fn restore_default_receive_handler(&self) {
        self.swap_handler(None);
    }

    fn swap_handler(&self, handler: Option<ReceiveHandler>) -> Option<ReceiveHandler> {
        let mut slot = self
            .inner
            .receive_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, handler)
    }

    /// Observe every message delivered by the default receive handler.
    pub fn on_message<F>(&self, observer: F)
    where
        F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner.on_message.push(Arc::new(observer));
    }

    /// Observe the end of the connection. Fires once.
    pub fn on_disconnect<F>(&self, observer: F)
    where
        F: Fn(&Connection, &DisconnectReason) + Send + Sync + 'static,
    {
        self.inner.on_disconnect.push(Arc::new(observer));
    }

    /// Observe handler failures and protocol violations.
    ///
    /// Registering an error observer keeps a failing receive handler from tearing
    /// the connection down.
    pub fn on_error<F>(&self, observer: F)
    where
        F: Fn(&Connection, &ProtocolError) + Send + Sync + 'static,
    {
        self.inner.on_error.push(Arc::new(observer));
    }

    /// Observe successful sends with the payload length before framing.
    pub fn on_send<F>(&self, observer: F)
    where
        F: Fn(&Connection, usize) + Send + Sync + 'static,
    {
        self.inner.on_send.push(Arc::new(observer));
    }

    /// Store a per-connection value, replacing any previous value under `key`.
    pub fn set_session<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        let map = self.inner.session.get_or_init(|| Mutex::new(HashMap::new()));
        lock(map).insert(key.into(), Arc::new(value));
    }

    /// Fetch a per-connection value. `None` if absent or of another type.
    pub fn session<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let map = self.inner.session.get()?;
        let value = lock(map).get(key)?.clone();
        value.downcast::<T>().ok()
    }

    pub fn remove_session(&self, key: &str) -> bool {
        self.inner
            .session
            .get()
            .is_some_and(|map| lock(map).remove(key).is_some())
    }

    /// Close the connection. Safe to call any number of times from any thread;
    /// the disconnect notification fires at most once.
    pub fn dispose(&self) {
        self.disconnect(DisconnectReason::Local);
    }

    /// The single disconnect path.
    pub(crate) fn disconnect(&self, reason: DisconnectReason) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let was_connected = {
            let mut state = lock(&self.inner.state);
            let previous = *state;
            *state = ConnectionState::Disconnected;
            previous == ConnectionState::Connected
        };

        self.inner.shutdown.cancel();
        self.release_stream();
        // Drops any pending send_and_wait reply slot.
        self.swap_handler(None);

        if !was_connected {
            debug!(conn_id = self.id(), %reason, "Disposed before connecting");
            return;
        }

        self.inner.metrics.connection_closed();
        if reason.is_error() {
            warn!(conn_id = self.id(), peer = ?self.peer_addr(), %reason, "Connection closed");
        } else {
            info!(conn_id = self.id(), peer = ?self.peer_addr(), %reason, "Connection closed");
        }

        for observer in self.inner.on_disconnect.snapshot() {
            notify("on_disconnect", || observer(self, &reason));
        }
        if let Some(supervisor) = self.supervisor() {
            notify("server_disconnect", || supervisor.on_disconnect(self, &reason));
        }
    }

    fn supervisor(&self) -> Option<Arc<dyn Supervisor>> {
        self.inner.supervisor.get().and_then(Weak::upgrade)
    }

    /// Deliver one reassembled frame. An `Err` asks the receive loop to stop.
    pub(crate) fn dispatch_frame(&self, payload: Bytes) -> std::result::Result<(), DisconnectReason> {
        self.inner.metrics.message_received(payload.len() as u64);
        let message = Message::from_connection(payload, self);

        let handler = self
            .inner
            .receive_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let outcome = invoke_handler(|| match handler {
            Some(handler) => handler(message),
            None => self.default_dispatch(&message),
        });

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if self.report_error(&e) => Ok(()),
            Err(e) => {
                error!(conn_id = self.id(), error = %e, "Unobserved handler error; closing connection");
                Err(DisconnectReason::HandlerError(e.to_string()))
            }
        }
    }

    /// Forward to the local observers, then to the accepting server.
    pub(crate) fn default_dispatch(&self, message: &Message) -> HandlerResult {
        for observer in self.inner.on_message.snapshot() {
            observer(message)?;
        }
        if let Some(supervisor) = self.supervisor() {
            supervisor.on_message(message)?;
        }
        Ok(())
    }

    /// Hand `error` to the error observers. Returns true if anyone was listening.
    pub(crate) fn report_error(&self, error: &ProtocolError) -> bool {
        let observers = self.inner.on_error.snapshot();
        for observer in &observers {
            notify("on_error", || observer(self, error));
        }
        let bubbled = self
            .supervisor()
            .is_some_and(|supervisor| supervisor.on_error(self, error));
        !observers.is_empty() || bubbled
    }

    pub(crate) fn record_protocol_violation(&self, error: &ProtocolError) {
        self.inner.metrics.protocol_error();
        self.report_error(error);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("peer", &self.peer_addr())
            .field("protocol", &self.protocol_name())
            .finish()
    }
}
