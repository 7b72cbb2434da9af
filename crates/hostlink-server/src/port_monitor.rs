//! Occupancy monitor for one fixed local port.
//!
//! Probes with a plain TCP connect. A successful connect means occupied;
//! refusal, timeout and every other error mean free. Only transitions are
//! reported to the transition callback.

use hostlink_core::messages::PortStatus;
use hostlink_core::{LinkError, LinkResult};
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// A single occupancy check.
pub trait PortProbe: Send + Sync {
    fn probe(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>>;
}

/// TCP connect probe against `addr`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    /// Probe `port` on the loopback interface.
    pub fn localhost(port: u16, timeout: Duration) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), timeout)
    }

    /// Try one TCP connect within the timeout.
    pub async fn connect(&self) -> LinkResult<()> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(LinkError::Probe(format!("{}: {e}", self.addr))),
            Err(_) => Err(LinkError::Probe(format!(
                "{}: timed out after {:?}",
                self.addr, self.timeout
            ))),
        }
    }
}

impl PortProbe for TcpProbe {
    fn probe(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            match self.connect().await {
                Ok(()) => true,
                // Any connect failure counts as free.
                Err(e) => {
                    debug!(error = %e, "port free");
                    false
                }
            }
        })
    }
}

/// Shared occupancy state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortMonitorState {
    pub occupied: bool,
    pub last_probe: Option<SystemTime>,
}

/// Invoked on every occupied/free transition.
pub type TransitionCallback = Arc<dyn Fn(PortStatus) + Send + Sync>;

pub struct PortMonitor {
    port: u16,
    interval: Duration,
    probe: Arc<dyn PortProbe>,
    state: Arc<Mutex<PortMonitorState>>,
    on_transition: TransitionCallback,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PortMonitor {
    pub fn new(
        port: u16,
        interval: Duration,
        probe: Arc<dyn PortProbe>,
        on_transition: TransitionCallback,
    ) -> Self {
        Self {
            port,
            interval,
            probe,
            state: Arc::new(Mutex::new(PortMonitorState::default())),
            on_transition,
            timer: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start the periodic probe: one immediate probe, then one per interval.
    /// A no-op while already running. Must be called within a tokio runtime.
    pub fn start_monitoring(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let port = self.port;
        let period = self.interval;
        let probe = self.probe.clone();
        let state = self.state.clone();
        let on_transition = self.on_transition.clone();
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let occupied = probe.probe().await;
                if record(&state, occupied) {
                    info!(port, occupied, "port occupancy changed");
                    on_transition(PortStatus { port, occupied });
                }
            }
        }));
        info!(port, interval_ms = self.interval.as_millis() as u64, "port monitor started");
    }

    /// Cancel the periodic probe. Idempotent.
    pub fn stop_monitoring(&self) {
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.abort();
            info!(port = self.port, "port monitor stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Run one periodic-style probe and report a transition if there was one.
    /// Returns whether the callback fired.
    pub async fn probe_and_notify(&self) -> bool {
        let occupied = self.probe.probe().await;
        let changed = record(&self.state, occupied);
        if changed {
            (self.on_transition)(PortStatus {
                port: self.port,
                occupied,
            });
        }
        changed
    }

    /// On-demand probe. Updates the probe timestamp but leaves the
    /// edge-detection state and the timer alone.
    pub async fn check_now(&self) -> PortStatus {
        let occupied = self.probe.probe().await;
        self.lock_state().last_probe = Some(SystemTime::now());
        PortStatus {
            port: self.port,
            occupied,
        }
    }

    pub fn state(&self) -> PortMonitorState {
        *self.lock_state()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PortMonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PortMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

/// Store an observation; true when it differs from the previous one.
fn record(state: &Mutex<PortMonitorState>, occupied: bool) -> bool {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    state.last_probe = Some(SystemTime::now());
    let changed = state.occupied != occupied;
    state.occupied = occupied;
    changed
}
