//! Live connection registry.
//!
//! Stores connections keyed by connection id. Each [`Connection`] is a cheap
//! handle onto its transport: an outbound frame queue drained by the
//! connection's writer task, a shared lifecycle state, and a close signal for
//! its reader task.

use hostlink_core::{generate_connection_id, LinkError, LinkResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Lifecycle of a single connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// A frame queued for the writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Handle to one live connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique connection id.
    pub id: String,
    /// Request path from the upgrade request.
    pub path: String,
    /// Query params from the upgrade request, `None` if there was no query.
    pub params: Option<HashMap<String, String>>,
    state: Arc<AtomicU8>,
    outbound: mpsc::UnboundedSender<Outbound>,
    close_signal: Arc<Notify>,
}

impl Connection {
    pub fn new(
        id: String,
        path: String,
        params: Option<HashMap<String, String>>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            id,
            path,
            params,
            state: Arc::new(AtomicU8::new(ConnectionState::Connecting as u8)),
            outbound,
            close_signal: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Move to `next` unless the connection is already at or past it.
    pub fn advance(&self, next: ConnectionState) {
        self.state.fetch_max(next as u8, Ordering::SeqCst);
    }

    /// Queue a text frame. Fails without touching the transport unless the
    /// connection is open.
    pub fn enqueue(&self, text: String) -> LinkResult<()> {
        if !self.is_open() {
            return Err(LinkError::ConnectionNotOpen(self.id.clone()));
        }
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| LinkError::ConnectionNotOpen(self.id.clone()))
    }

    /// Start closing: queue a close frame and wake the reader task.
    ///
    /// Calling this on a connection that is already closing is a no-op.
    pub fn close(&self, code: u16, reason: &str) {
        let prev = self
            .state
            .fetch_max(ConnectionState::Closing as u8, Ordering::SeqCst);
        if prev >= ConnectionState::Closing as u8 {
            return;
        }
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.close_signal.notify_one();
        debug!(connection_id = %self.id, code, "connection closing");
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.close_signal.notified().await;
    }
}

#[derive(Debug, Default)]
struct Slots {
    connections: HashMap<String, Connection>,
    /// Set by [`ConnectionRegistry::seal`]; no insert succeeds afterwards.
    sealed: bool,
}

/// Registry of live connections, private to one gateway.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    slots: RwLock<Slots>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a connection under a freshly generated id that is not in use.
    ///
    /// Returns `None` without calling `build` once the registry is sealed.
    pub fn insert_with_fresh_id<F>(&self, build: F) -> Option<Connection>
    where
        F: FnOnce(String) -> Connection,
    {
        let mut slots = self.write();
        if slots.sealed {
            return None;
        }
        let mut id = generate_connection_id();
        while slots.connections.contains_key(&id) {
            id = generate_connection_id();
        }
        let conn = build(id.clone());
        slots.connections.insert(id, conn.clone());
        Some(conn)
    }

    /// Refuse all further inserts and return every connection registered
    /// at the moment of sealing.
    pub fn seal(&self) -> Vec<Connection> {
        let mut slots = self.write();
        slots.sealed = true;
        slots.connections.values().cloned().collect()
    }

    pub fn is_sealed(&self) -> bool {
        self.read().sealed
    }

    pub fn get(&self, id: &str) -> Option<Connection> {
        self.read().connections.get(id).cloned()
    }

    /// Remove a connection. Returns it along with whether the registry is
    /// now empty, evaluated under the same lock.
    pub fn remove(&self, id: &str) -> Option<(Connection, bool)> {
        let mut slots = self.write();
        slots
            .connections
            .remove(id)
            .map(|conn| (conn, slots.connections.is_empty()))
    }

    /// Snapshot of every registered connection.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.read().connections.values().cloned().collect()
    }

    /// Snapshot of connections that are open right now.
    pub fn open_connections(&self) -> Vec<Connection> {
        self.snapshot().into_iter().filter(Connection::is_open).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.read().connections.keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.write().connections.clear();
    }

    pub fn len(&self) -> usize {
        self.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
