//! hostlink-server: sandbox host gateway.
//!
//! Accepts WebSocket connections from browser clients and multiplexes
//! JSON-framed messages onto pty-backed shells, directory watches and a
//! local port occupancy monitor.

pub mod config;
pub mod fs_watch;
pub mod gateway;
pub mod port_monitor;
pub mod protocol;
pub mod terminal;
pub mod transport;

pub use config::{CliOverrides, GatewayConfig};
pub use gateway::{MessageContext, SessionGateway, WeakSessionGateway};
pub use protocol::register_builtin_handlers;
pub use transport::start_listener;
