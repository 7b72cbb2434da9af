//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections and hands each one to
//! [`SessionGateway::handle_upgrade`], which runs the handshake and registers
//! the connection. The accept loop ends when the gateway closes its acceptor.

use crate::gateway::SessionGateway;
use hostlink_core::{LinkError, LinkResult};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Bind `bind_addr` and start accepting WebSocket upgrades for `gateway`.
///
/// Returns the bound address (useful with port 0) and the accept task.
pub async fn start_listener(
    gateway: SessionGateway,
    bind_addr: SocketAddr,
) -> LinkResult<(SocketAddr, JoinHandle<()>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| LinkError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let mut acceptor_closed = gateway.acceptor_closed();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = acceptor_closed.wait_for(|closed| *closed) => {
                    if changed.is_err() {
                        warn!("gateway dropped, stopping listener");
                    }
                    break;
                }
                accepted = tcp_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let gateway = gateway.clone();
                        tokio::spawn(async move {
                            match gateway.handle_upgrade(stream, addr).await {
                                Ok(id) => debug!(remote = %addr, connection_id = %id, "WebSocket connection accepted"),
                                Err(e) => warn!(remote = %addr, error = %e, "WebSocket upgrade failed"),
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                    }
                }
            }
        }
        info!(addr = %local_addr, "WebSocket listener stopped");
    });

    Ok((local_addr, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn listener_stops_after_teardown() {
        let gateway = SessionGateway::new(GatewayConfig {
            port_monitor_enabled: false,
            ..GatewayConfig::default()
        });
        let (addr, task) = start_listener(gateway.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(addr.port(), 0);

        gateway.disconnect(None).await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("listener did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_transport_error() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway = SessionGateway::new(GatewayConfig::default());
        let err = start_listener(gateway, held.local_addr().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
    }
}
