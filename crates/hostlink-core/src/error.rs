use thiserror::Error;

/// Errors produced by the hostlink gateway and its protocol layer.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("connection not open: {0}")]
    ConnectionNotOpen(String),

    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    #[error("message parse error: {0}")]
    MessageParse(String),

    #[error("terminal spawn failed: {0}")]
    TerminalSpawn(String),

    #[error("terminal not alive: {0}")]
    TerminalNotAlive(String),

    #[error("port probe failed: {0}")]
    Probe(String),

    #[error("watch error: {0}")]
    Watch(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type LinkResult<T> = Result<T, LinkError>;
