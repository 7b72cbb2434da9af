//! A single pty-backed shell session.
//!
//! Spawn failures are captured rather than returned: the session is created
//! in the `Uninitialized` state, the error is kept for [`TerminalSession::init_error`]
//! and pushed through the data observer when one was supplied. Operations on
//! a session that is not alive report a failure through the observer and
//! never touch the process.

use super::pty::{take_utf8, PtyBackend, PtyHandle, PtyIo, PtyOptions};
use hostlink_core::LinkError;
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Output observer: `(success, data, correlation_id)`.
pub type DataObserver = Arc<dyn Fn(bool, String, Option<String>) + Send + Sync>;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    /// Spawn failed; see [`TerminalSession::init_error`].
    Uninitialized,
    Alive,
    /// Killed or exited. Terminal, never restarts.
    Dead,
}

struct SessionInner {
    state: TerminalState,
    backend: Option<Box<dyn PtyBackend>>,
    init_error: Option<String>,
    last_command: String,
}

pub struct TerminalSession {
    id: String,
    owner: String,
    inner: Mutex<SessionInner>,
    observer: RwLock<Option<DataObserver>>,
}

impl TerminalSession {
    /// Spawn a shell and start forwarding its output and exit to the observer.
    ///
    /// Blocking: call from a blocking context.
    pub fn spawn(
        id: String,
        owner: String,
        options: &PtyOptions,
        observer: Option<DataObserver>,
    ) -> Arc<Self> {
        match PtyHandle::spawn(options) {
            Ok((handle, io)) => {
                let session = Self::with_backend(id, owner, Box::new(handle), observer);
                session.start_io(io);
                session
            }
            Err(e) => {
                warn!(terminal_id = %id, error = %e, "terminal spawn failed");
                let session = Arc::new(Self {
                    id,
                    owner,
                    inner: Mutex::new(SessionInner {
                        state: TerminalState::Uninitialized,
                        backend: None,
                        init_error: Some(e.to_string()),
                        last_command: String::new(),
                    }),
                    observer: RwLock::new(observer),
                });
                session.notify(false, e.to_string(), None);
                session
            }
        }
    }

    /// Build a live session over an already running backend.
    pub fn with_backend(
        id: String,
        owner: String,
        backend: Box<dyn PtyBackend>,
        observer: Option<DataObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner,
            inner: Mutex::new(SessionInner {
                state: TerminalState::Alive,
                backend: Some(backend),
                init_error: None,
                last_command: String::new(),
            }),
            observer: RwLock::new(observer),
        })
    }

    fn start_io(self: &Arc<Self>, io: PtyIo) {
        let PtyIo { mut reader, mut child } = io;

        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            let mut pending = Vec::new();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        let text = take_utf8(&mut pending);
                        if !text.is_empty() {
                            session.notify(true, text, None);
                        }
                    }
                    Err(e) => {
                        debug!(terminal_id = %session.id, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
        });

        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            // ExitStatus's Display names the terminating signal, if any.
            let message = match child.wait() {
                Ok(status) if status.success() => "process exited with code 0".to_string(),
                Ok(status) => format!("process exited with code {} ({status})", status.exit_code()),
                Err(e) => format!("process wait failed: {e}"),
            };
            info!(terminal_id = %session.id, %message, "terminal exited");
            session.mark_dead();
            session.notify(false, message, None);
        });
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connection id of the client that created this session.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn state(&self) -> TerminalState {
        self.lock().state
    }

    pub fn is_alive(&self) -> bool {
        self.state() == TerminalState::Alive
    }

    /// The spawn error, if construction failed.
    pub fn init_error(&self) -> Option<String> {
        self.lock().init_error.clone()
    }

    pub fn last_command(&self) -> String {
        self.lock().last_command.clone()
    }

    /// Register the output observer, replacing any previous one.
    pub fn on_data(&self, observer: DataObserver) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    /// Resize the terminal. Both dimensions are clamped to at least 1.
    pub fn update_size(&self, cols: i64, rows: i64) {
        let cols = clamp_dimension(cols);
        let rows = clamp_dimension(rows);
        let result = {
            let mut inner = self.lock();
            match (inner.state, inner.backend.as_mut()) {
                (TerminalState::Alive, Some(backend)) => Some(backend.resize(cols, rows)),
                _ => None,
            }
        };
        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => self.notify(false, format!("resize failed: {e}"), None),
            None => self.notify(false, self.not_alive_message(), None),
        }
    }

    /// Write `text` to the shell as raw bytes and remember it as the last
    /// command.
    pub fn create_command(&self, text: &str, correlation_id: Option<String>) {
        let result = {
            let mut inner = self.lock();
            if inner.state != TerminalState::Alive {
                None
            } else {
                inner.last_command = text.to_string();
                inner.backend.as_mut().map(|b| b.write(text.as_bytes()))
            }
        };
        match result {
            Some(Ok(())) => {}
            Some(Err(e)) => self.notify(false, format!("write failed: {e}"), correlation_id),
            None => self.notify(false, self.not_alive_message(), correlation_id),
        }
    }

    /// Kill the shell. Killing a session that is not alive is a no-op.
    pub fn kill(&self) {
        let backend = {
            let mut inner = self.lock();
            if inner.state != TerminalState::Alive {
                return;
            }
            inner.state = TerminalState::Dead;
            inner.backend.take()
        };
        if let Some(mut backend) = backend {
            if let Err(e) = backend.kill() {
                debug!(terminal_id = %self.id, error = %e, "kill reported an error");
            }
        }
        info!(terminal_id = %self.id, "terminal killed");
    }

    fn mark_dead(&self) {
        let mut inner = self.lock();
        if inner.state == TerminalState::Alive {
            inner.state = TerminalState::Dead;
            inner.backend = None;
        }
    }

    fn not_alive_message(&self) -> String {
        match self.init_error() {
            Some(err) => LinkError::TerminalNotAlive(format!("{} failed to start: {err}", self.id)),
            None => LinkError::TerminalNotAlive(self.id.clone()),
        }
        .to_string()
    }

    fn notify(&self, success: bool, data: String, correlation_id: Option<String>) {
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(success, data, correlation_id);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn clamp_dimension(v: i64) -> u16 {
    v.clamp(1, i64::from(u16::MAX)) as u16
}
