//! hostlink: sandbox host gateway.
//!
//! Serves WebSocket sessions that drive shells, watch directories and report
//! whether the sandbox's dev-server port is in use.

use clap::Parser;
use hostlink_server::{register_builtin_handlers, start_listener, CliOverrides, GatewayConfig, SessionGateway};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};

/// hostlink: sandbox host gateway
#[derive(Parser, Debug)]
#[command(name = "hostlink", version, about = "Sandbox host gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.hostlink/config.toml")]
    config: String,

    /// Shell for new terminals
    #[arg(long)]
    shell: Option<String>,

    /// Working directory for new terminals
    #[arg(long)]
    cwd: Option<String>,

    /// Local port whose occupancy is reported to clients
    #[arg(long)]
    monitored_port: Option<u16>,

    /// Disable the periodic port monitor
    #[arg(long)]
    disable_port_monitor: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(
        Some(&config_path),
        CliOverrides {
            bind: cli.bind,
            port: cli.port,
            shell: cli.shell,
            cwd: cli.cwd,
            monitored_port: cli.monitored_port,
            disable_port_monitor: cli.disable_port_monitor,
        },
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        shell = %config.shell,
        monitored_port = config.monitored_port,
        "starting hostlink"
    );

    let bind_addr: SocketAddr = match format!("{}:{}", config.bind, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(bind = %config.bind, port = config.port, error = %e, "invalid bind address");
            std::process::exit(1);
        }
    };

    let gateway = SessionGateway::new(config);
    register_builtin_handlers(&gateway);

    let (addr, listener) = match start_listener(gateway.clone(), bind_addr).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start listener");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "listening");

    tokio::select! {
        result = listener => {
            if let Err(e) = result {
                error!(error = %e, "listener task failed");
                std::process::exit(1);
            }
            info!("all clients gone, gateway shut down");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            gateway.disconnect(None).await;
        }
    }

    info!("hostlink stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
