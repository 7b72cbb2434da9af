//! Gateway configuration: TOML file + CLI overrides.

use hostlink_core::{LinkError, LinkResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub terminal: TerminalSection,
    #[serde(default)]
    pub ports: PortsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[terminal]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TerminalSection {
    /// Shell binary; `$SHELL` or `/bin/bash` when unset.
    #[serde(default)]
    pub shell: Option<String>,
    /// Working directory for new shells; the process cwd when unset.
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

/// `[ports]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PortsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monitored_port")]
    pub monitored_port: u16,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for PortsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            monitored_port: default_monitored_port(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8283
}
fn default_monitored_port() -> u16 {
    3000
}
fn default_probe_interval_ms() -> u64 {
    2000
}
fn default_probe_timeout_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

fn default_cwd() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}

/// Values supplied on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub monitored_port: Option<u16>,
    pub disable_port_monitor: bool,
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: String,
    pub port: u16,
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub port_monitor_enabled: bool,
    pub monitored_port: u16,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), CliOverrides::default())
    }
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(config_path: Option<&Path>, overrides: CliOverrides) -> LinkResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| LinkError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::resolve(file_config, overrides))
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> Self {
        let shell = cli
            .shell
            .or(file.terminal.shell)
            .unwrap_or_else(default_shell);
        let cwd = cli
            .cwd
            .or(file.terminal.cwd)
            .map(|s| expand_tilde_str(&s))
            .unwrap_or_else(default_cwd);

        Self {
            bind: cli.bind.unwrap_or(file.server.bind),
            port: cli.port.unwrap_or(file.server.port),
            shell,
            cwd,
            cols: file.terminal.cols.unwrap_or(80).max(1),
            rows: file.terminal.rows.unwrap_or(24).max(1),
            port_monitor_enabled: file.ports.enabled && !cli.disable_port_monitor,
            monitored_port: cli.monitored_port.unwrap_or(file.ports.monitored_port),
            probe_interval: Duration::from_millis(file.ports.probe_interval_ms.max(1)),
            probe_timeout: Duration::from_millis(file.ports.probe_timeout_ms.max(1)),
        }
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.port, 8283);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.monitored_port, 3000);
        assert_eq!((cfg.cols, cfg.rows), (80, 24));
        assert_eq!(cfg.probe_interval, Duration::from_millis(2000));
        assert!(cfg.port_monitor_enabled);
    }

    #[test]
    fn parse_partial_toml() {
        let file: ConfigFile = toml::from_str(
            r#"
[server]
port = 9000

[ports]
monitored_port = 5173
"#,
        )
        .unwrap();
        let cfg = GatewayConfig::resolve(file, CliOverrides::default());
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.monitored_port, 5173);
        assert_eq!(cfg.probe_timeout, Duration::from_millis(500));
    }

    #[test]
    fn cli_overrides_file() {
        let file: ConfigFile = toml::from_str(
            r#"
[server]
port = 9000
[terminal]
shell = "/bin/zsh"
"#,
        )
        .unwrap();
        let cfg = GatewayConfig::resolve(
            file,
            CliOverrides {
                port: Some(7000),
                shell: Some("/bin/sh".into()),
                disable_port_monitor: true,
                ..Default::default()
            },
        );
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.shell, "/bin/sh");
        assert!(!cfg.port_monitor_enabled);
    }

    #[test]
    fn zero_geometry_is_clamped() {
        let file: ConfigFile = toml::from_str("[terminal]\ncols = 0\nrows = 0\n").unwrap();
        let cfg = GatewayConfig::resolve(file, CliOverrides::default());
        assert_eq!((cfg.cols, cfg.rows), (1, 1));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = GatewayConfig::load(
            Some(Path::new("/nonexistent/hostlink/config.toml")),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.port, 8283);
    }

    #[test]
    fn bad_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        let err = GatewayConfig::load(Some(&path), CliOverrides::default()).unwrap_err();
        assert!(matches!(err, LinkError::Config(_)));
    }
}
