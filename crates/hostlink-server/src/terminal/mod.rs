//! Terminal sessions: PTY wrapper, per-shell session state, and the manager.

pub mod manager;
pub mod pty;
pub mod session;

pub use manager::{TerminalDefaults, TerminalManager};
pub use pty::{PtyBackend, PtyHandle, PtyOptions};
pub use session::{DataObserver, TerminalSession, TerminalState};
