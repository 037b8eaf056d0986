//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all bridge failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Agent process could not be spawned or its pipes could not be created.
    Spawn(String),
    /// Writing to the agent's stdin failed (closed or broken pipe).
    Write(String),
    /// No response arrived within the request timeout.
    Timeout(String),
    /// The agent answered with a well-formed JSON-RPC error object.
    Protocol(String),
    /// Framing or serialisation failure on the wire.
    Codec(String),
    /// The caller cancelled the turn before a reply arrived.
    Cancelled,
    /// The tail transport could not find the agent's session log.
    Discovery(String),
    /// The tail transport saw no agent message before the deadline.
    TailTimeout(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error indicates the agent's input stream is unusable.
    #[must_use]
    pub fn is_write_failure(&self) -> bool {
        matches!(self, Self::Write(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Write(msg) => write!(f, "write: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Discovery(msg) => write!(f, "session discovery: {msg}"),
            Self::TailTimeout(msg) => write!(f, "tail timeout: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
