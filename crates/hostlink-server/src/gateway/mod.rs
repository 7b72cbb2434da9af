//! Session gateway: connection lifecycle, message dispatch, and teardown.
//!
//! # Submodule Architecture
//!
//! - **[`registry`]**: the [`ConnectionRegistry`] of live [`Connection`]s and
//!   their `Connecting -> Open -> Closing -> Closed` state.
//! - **[`handlers`]**: the [`HandlerTable`] mapping an open message-type
//!   string to exactly one [`Handler`].
//!
//! # Data Flow
//!
//! ```text
//! TCP accept (transport::websocket)
//!   -> SessionGateway::handle_upgrade   WS handshake, capture request target
//!     -> SessionGateway::upgrade        register connection, spawn tasks
//!        writer task: outbound queue -> WS sink
//!        reader task: WS stream -> decode_frame -> HandlerTable -> handler
//!                     close -> on_close callback -> remove -> teardown if empty
//! handlers / terminals / watches / port monitor
//!   -> send / broadcast -> Connection::enqueue -> writer task
//! ```
//!
//! Terminals, directory watches and the port monitor are created lazily on
//! first use and disposed by [`SessionGateway::disconnect`].

pub mod handlers;
pub mod registry;

pub use handlers::{handler_fn, Handler, HandlerFuture, HandlerTable, MessageContext};
pub use registry::{Connection, ConnectionRegistry, ConnectionState, Outbound};

use crate::config::GatewayConfig;
use crate::fs_watch::FilesystemWatcher;
use crate::port_monitor::{PortMonitor, TcpProbe};
use crate::terminal::{TerminalDefaults, TerminalManager};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use hostlink_core::messages::PortStatus;
use hostlink_core::{decode_frame, encode_frame, msg, Envelope, LinkError, LinkResult};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

/// Maximum WebSocket message size (1 MiB).
const MAX_WS_MESSAGE_SIZE: usize = 1_048_576;

/// Close code used when the gateway closes a connection itself.
const CLOSE_NORMAL: u16 = 1000;
/// Close code used for connections closed by a full teardown.
const CLOSE_GOING_AWAY: u16 = 1001;
/// Close code reported when the peer sent a close frame without a code.
const CLOSE_NO_STATUS: u16 = 1005;
/// Close code reported when the transport dropped without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

/// Called with the id of a newly opened connection.
pub type OpenCallback = Arc<dyn Fn(&str) + Send + Sync>;
/// Called with `(connection_id, code, reason, was_clean)`.
pub type CloseCallback = Arc<dyn Fn(&str, u16, &str, bool) + Send + Sync>;
/// Called with the connection id and the transport error.
pub type ErrorCallback = Arc<dyn Fn(&str, &LinkError) + Send + Sync>;
/// Called with the id of a connection accepted by the server.
pub type ConnectionCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Single-slot lifecycle callbacks; registering again replaces the slot.
#[derive(Default)]
struct Callbacks {
    open: RwLock<Option<OpenCallback>>,
    close: RwLock<Option<CloseCallback>>,
    error: RwLock<Option<ErrorCallback>>,
    connection: RwLock<Option<ConnectionCallback>>,
}

fn slot<T: Clone>(lock: &RwLock<Option<T>>) -> Option<T> {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn set_slot<T>(lock: &RwLock<Option<T>>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = Some(value);
}

struct GatewayInner {
    config: GatewayConfig,
    registry: ConnectionRegistry,
    handlers: HandlerTable,
    callbacks: Callbacks,
    terminals: OnceLock<Arc<TerminalManager>>,
    watcher: OnceLock<Arc<FilesystemWatcher>>,
    port_monitor: OnceLock<Arc<PortMonitor>>,
    /// Set once by the full teardown.
    shut_down: AtomicBool,
    /// Flipped to `true` to close the acceptor.
    acceptor_tx: watch::Sender<bool>,
}

/// The gateway facade. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct SessionGateway {
    inner: Arc<GatewayInner>,
}

/// Non-owning counterpart of [`SessionGateway`].
#[derive(Clone)]
pub struct WeakSessionGateway(Weak<GatewayInner>);

impl WeakSessionGateway {
    pub fn upgrade(&self) -> Option<SessionGateway> {
        self.0.upgrade().map(|inner| SessionGateway { inner })
    }
}

impl SessionGateway {
    pub fn new(config: GatewayConfig) -> Self {
        let (acceptor_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(GatewayInner {
                config,
                registry: ConnectionRegistry::new(),
                handlers: HandlerTable::new(),
                callbacks: Callbacks::default(),
                terminals: OnceLock::new(),
                watcher: OnceLock::new(),
                port_monitor: OnceLock::new(),
                shut_down: AtomicBool::new(false),
                acceptor_tx,
            }),
        }
    }

    /// Weak handle for callbacks owned by gateway resources (terminal
    /// observers, watch callbacks, the port monitor), so they do not keep
    /// the gateway alive.
    pub fn downgrade(&self) -> WeakSessionGateway {
        WeakSessionGateway(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    // ── Handler registration ────────────────────────────────────────

    /// Register the handler for `msg_type`. The last registration wins.
    pub fn on_message_type<F, Fut>(&self, msg_type: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LinkResult<()>> + Send + 'static,
    {
        self.register_handler(msg_type, handler_fn(handler))
    }

    /// Alias for [`on_message_type`](Self::on_message_type).
    pub fn on<F, Fut>(&self, msg_type: impl Into<String>, handler: F) -> &Self
    where
        F: Fn(MessageContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LinkResult<()>> + Send + 'static,
    {
        self.on_message_type(msg_type, handler)
    }

    /// Register an already boxed handler.
    pub fn register_handler(&self, msg_type: impl Into<String>, handler: Handler) -> &Self {
        let msg_type = msg_type.into();
        if self.inner.handlers.register(msg_type.clone(), handler).is_some() {
            debug!(msg_type = %msg_type, "handler replaced");
        }
        self
    }

    pub fn has_handler(&self, msg_type: &str) -> bool {
        self.inner.handlers.contains(msg_type)
    }

    // ── Lifecycle callbacks ─────────────────────────────────────────

    pub fn on_open(&self, cb: impl Fn(&str) + Send + Sync + 'static) -> &Self {
        set_slot(&self.inner.callbacks.open, Arc::new(cb) as OpenCallback);
        self
    }

    pub fn on_close(&self, cb: impl Fn(&str, u16, &str, bool) + Send + Sync + 'static) -> &Self {
        set_slot(&self.inner.callbacks.close, Arc::new(cb) as CloseCallback);
        self
    }

    pub fn on_error(&self, cb: impl Fn(&str, &LinkError) + Send + Sync + 'static) -> &Self {
        set_slot(&self.inner.callbacks.error, Arc::new(cb) as ErrorCallback);
        self
    }

    pub fn on_connection(&self, cb: impl Fn(&str) + Send + Sync + 'static) -> &Self {
        set_slot(
            &self.inner.callbacks.connection,
            Arc::new(cb) as ConnectionCallback,
        );
        self
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Send `msg_type` with `payload` to one connection.
    ///
    /// Fails with [`LinkError::ConnectionNotFound`] for unknown ids and
    /// [`LinkError::ConnectionNotOpen`] unless the connection is open.
    /// Returns once the frame is queued for the transport.
    pub fn send(&self, connection_id: &str, msg_type: &str, payload: Value) -> LinkResult<()> {
        self.send_envelope(connection_id, Envelope::new(msg_type, payload))
    }

    /// Send a prebuilt envelope to one connection.
    pub fn send_envelope(&self, connection_id: &str, envelope: Envelope) -> LinkResult<()> {
        let conn = self
            .inner
            .registry
            .get(connection_id)
            .ok_or_else(|| LinkError::ConnectionNotFound(connection_id.to_string()))?;
        if !conn.is_open() {
            return Err(LinkError::ConnectionNotOpen(connection_id.to_string()));
        }
        conn.enqueue(encode_frame(&envelope)?)
    }

    /// Fire-and-forget [`send`](Self::send); failures are logged.
    pub fn send_to_connection(&self, connection_id: &str, msg_type: &str, payload: Value) {
        if let Err(e) = self.send(connection_id, msg_type, payload) {
            debug!(connection_id, msg_type, error = %e, "send_to_connection dropped");
        }
    }

    /// Send to every connection open at call time. Best effort: one failed
    /// delivery never affects the others. Returns how many were queued.
    pub fn broadcast(&self, msg_type: &str, payload: Value) -> usize {
        let targets = self.inner.registry.open_connections();
        let env = Envelope::new(msg_type, payload);
        let frame = match encode_frame(&env) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(msg_type, error = %e, "broadcast encode failed");
                return 0;
            }
        };
        let mut delivered = 0;
        for conn in targets {
            match conn.enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(connection_id = %conn.id, error = %e, "broadcast skipped connection"),
            }
        }
        trace!(msg_type, delivered, "broadcast");
        delivered
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.inner
            .registry
            .get(connection_id)
            .is_some_and(|c| c.is_open())
    }

    /// Ids of every registered connection.
    pub fn connections(&self) -> Vec<String> {
        self.inner.registry.ids()
    }

    pub fn connection(&self, connection_id: &str) -> Option<Connection> {
        self.inner.registry.get(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn path(&self, connection_id: &str) -> Option<String> {
        self.inner.registry.get(connection_id).map(|c| c.path)
    }

    pub fn params(&self, connection_id: &str) -> Option<HashMap<String, String>> {
        self.inner
            .registry
            .get(connection_id)
            .and_then(|c| c.params)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` when the acceptor must close.
    pub fn acceptor_closed(&self) -> watch::Receiver<bool> {
        self.inner.acceptor_tx.subscribe()
    }

    // ── Managed resources (lazy) ────────────────────────────────────

    pub fn terminals(&self) -> Arc<TerminalManager> {
        self.inner
            .terminals
            .get_or_init(|| {
                let cfg = &self.inner.config;
                Arc::new(TerminalManager::new(TerminalDefaults {
                    shell: cfg.shell.clone(),
                    cwd: cfg.cwd.clone(),
                    cols: cfg.cols,
                    rows: cfg.rows,
                }))
            })
            .clone()
    }

    pub fn fs_watcher(&self) -> Arc<FilesystemWatcher> {
        self.inner
            .watcher
            .get_or_init(|| Arc::new(FilesystemWatcher::new()))
            .clone()
    }

    pub fn port_monitor(&self) -> Arc<PortMonitor> {
        self.inner
            .port_monitor
            .get_or_init(|| {
                let cfg = &self.inner.config;
                let weak = self.downgrade();
                Arc::new(PortMonitor::new(
                    cfg.monitored_port,
                    cfg.probe_interval,
                    Arc::new(TcpProbe::localhost(cfg.monitored_port, cfg.probe_timeout)),
                    Arc::new(move |status: PortStatus| {
                        if let Some(gw) = weak.upgrade() {
                            gw.broadcast(msg::PORT_CHANGED, serde_json::json!(status));
                        }
                    }),
                ))
            })
            .clone()
    }

    // ── Upgrade ─────────────────────────────────────────────────────

    /// Server-side entry point: run the WebSocket handshake on an accepted
    /// TCP stream, register the connection, then fire the connection
    /// callback.
    pub async fn handle_upgrade(&self, stream: TcpStream, remote: SocketAddr) -> LinkResult<String> {
        if self.is_shut_down() {
            return Err(LinkError::HandshakeFailure("gateway is shut down".into()));
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(MAX_WS_MESSAGE_SIZE),
            max_frame_size: Some(MAX_WS_MESSAGE_SIZE),
            ..Default::default()
        };
        let mut target = String::from("/");
        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            target = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            Ok(resp)
        };
        let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, capture, Some(ws_config))
            .await
            .map_err(|e| LinkError::HandshakeFailure(format!("{remote}: {e}")))?;

        let id = self.upgrade(&target, ws).await?;
        if let Some(cb) = slot(&self.inner.callbacks.connection) {
            cb(&id);
        }
        Ok(id)
    }

    /// Register an established WebSocket as a new connection.
    ///
    /// `request_target` is the upgrade request's path and query, e.g.
    /// `/term?cols=80`. Spawns the connection's reader and writer tasks and
    /// fires the open callback. Fails with [`LinkError::HandshakeFailure`]
    /// once the full teardown has started.
    pub async fn upgrade<S>(&self, request_target: &str, ws: WebSocketStream<S>) -> LinkResult<String>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let target = hostlink_core::parse_request_target(request_target);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let conn = self
            .inner
            .registry
            .insert_with_fresh_id(|id| Connection::new(id, target.path, target.params, outbound_tx))
            .ok_or_else(|| LinkError::HandshakeFailure("gateway is shut down".into()))?;

        let (sink, stream) = ws.split();
        tokio::spawn(write_loop(conn.id.clone(), sink, outbound_rx));
        conn.advance(ConnectionState::Open);

        info!(
            connection_id = %conn.id,
            path = %conn.path,
            connections = self.inner.registry.len(),
            "connection open"
        );

        if let Some(cb) = slot(&self.inner.callbacks.open) {
            cb(&conn.id);
        }
        if self.inner.config.port_monitor_enabled {
            let monitor = self.port_monitor();
            monitor.start_monitoring();
            // A teardown that ran since the insert may already have stopped it.
            if self.inner.registry.is_sealed() {
                monitor.stop_monitoring();
            }
        }

        let id = conn.id.clone();
        tokio::spawn(self.clone().read_loop(conn, stream));
        Ok(id)
    }

    // ── Inbound ─────────────────────────────────────────────────────

    async fn read_loop<S>(self, conn: Connection, mut stream: SplitStream<WebSocketStream<S>>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (code, reason, was_clean) = loop {
            tokio::select! {
                _ = conn.closed() => {
                    break (CLOSE_NORMAL, "closed by gateway".to_string(), true);
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch_text(&conn, &text).await,
                    Some(Ok(Message::Binary(data))) => {
                        debug!(connection_id = %conn.id, len = data.len(), "binary frame dropped");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        // The writer's close flushes the reply tungstenite queued.
                        conn.close(CLOSE_NORMAL, "");
                        break match frame {
                            Some(f) => (u16::from(f.code), f.reason.to_string(), true),
                            None => (CLOSE_NO_STATUS, String::new(), true),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let err = LinkError::Transport(e.to_string());
                        warn!(connection_id = %conn.id, error = %err, "transport error");
                        if let Some(cb) = slot(&self.inner.callbacks.error) {
                            cb(&conn.id, &err);
                        }
                        break (CLOSE_ABNORMAL, e.to_string(), false);
                    }
                    None => break (CLOSE_ABNORMAL, "connection dropped".to_string(), false),
                }
            }
        };
        self.handle_close(conn, code, reason, was_clean).await;
    }

    /// Decode one text frame and run its handler. Malformed frames and
    /// unknown types are dropped.
    async fn dispatch_text(&self, conn: &Connection, text: &str) {
        if !conn.is_open() {
            return;
        }
        let envelope = match decode_frame(text) {
            Ok(env) => env,
            Err(e) => {
                warn!(connection_id = %conn.id, error = %e, "dropping malformed frame");
                return;
            }
        };
        let Some(handler) = self.inner.handlers.get(&envelope.msg_type) else {
            trace!(connection_id = %conn.id, msg_type = %envelope.msg_type, "no handler");
            return;
        };
        let msg_type = envelope.msg_type.clone();
        let ctx = MessageContext {
            gateway: self.clone(),
            connection_id: conn.id.clone(),
            envelope,
        };
        if let Err(e) = handler(ctx).await {
            warn!(connection_id = %conn.id, msg_type = %msg_type, error = %e, "handler failed");
        }
    }

    async fn handle_close(&self, conn: Connection, code: u16, reason: String, was_clean: bool) {
        conn.advance(ConnectionState::Closed);
        info!(connection_id = %conn.id, code, reason = %reason, was_clean, "connection closed");

        if let Some(cb) = slot(&self.inner.callbacks.close) {
            cb(&conn.id, code, &reason, was_clean);
        }
        if let Some(terminals) = self.inner.terminals.get() {
            terminals.kill_owned_by(&conn.id).await;
        }
        if let Some((_, now_empty)) = self.inner.registry.remove(&conn.id) {
            if now_empty {
                info!("last connection closed, releasing resources");
                self.teardown().await;
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Close one connection, or with `None` run the full teardown.
    ///
    /// Removing the last connection also runs the full teardown. The full
    /// teardown is idempotent.
    pub async fn disconnect(&self, connection_id: Option<&str>) {
        match connection_id {
            Some(id) => {
                let Some((conn, now_empty)) = self.inner.registry.remove(id) else {
                    debug!(connection_id = id, "disconnect: unknown connection");
                    return;
                };
                conn.close(CLOSE_NORMAL, "disconnected");
                if let Some(terminals) = self.inner.terminals.get() {
                    terminals.kill_owned_by(id).await;
                }
                info!(connection_id = id, "connection disconnected");
                if now_empty {
                    self.teardown().await;
                }
            }
            None => self.teardown().await,
        }
    }

    /// The single full-teardown sequence: close every transport, kill every
    /// terminal, close every watch, stop the port monitor, clear the
    /// registry, close the acceptor.
    async fn teardown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let open = self.inner.registry.seal();
        info!(connections = open.len(), "gateway teardown");

        for conn in open {
            conn.close(CLOSE_GOING_AWAY, "gateway shutting down");
        }
        if let Some(terminals) = self.inner.terminals.get() {
            terminals.kill_all().await;
        }
        if let Some(watcher) = self.inner.watcher.get() {
            watcher.cleanup();
        }
        if let Some(monitor) = self.inner.port_monitor.get() {
            monitor.stop_monitoring();
        }
        self.inner.registry.clear();
        self.inner.acceptor_tx.send_replace(true);
        info!("gateway shut down");
    }
}

/// Drain the outbound queue into the WebSocket sink.
async fn write_loop<S>(
    connection_id: String,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = outbound.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    debug!(connection_id = %connection_id, error = %e, "WS send failed");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
    trace!(connection_id = %connection_id, "writer finished");
}
