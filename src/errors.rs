//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Local socket or channel transport failure.
    Ipc(String),
    /// Inbound message failed to decode into a typed envelope.
    Protocol(String),
    /// Request handler failed while servicing a request.
    Dispatch(String),
    /// Originating channel disconnected before its queued work could run.
    Disconnected(String),
    /// The user denied an interactive confirmation.
    Rejected(String),
    /// An interactive confirmation expired before it was answered.
    Expired(String),
    /// Operation reached the chain but was not applied.
    OperationFailed(String),
    /// Operation was not found before the confirmation deadline.
    OperationTimeout(String),
    /// Caller aborted the wait.
    Cancelled(String),
    /// Node RPC or feed failure.
    Network(String),
    /// Error response returned by the server for a client request.
    Remote(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Dispatch(msg) => write!(f, "dispatch: {msg}"),
            Self::Disconnected(msg) => write!(f, "disconnected: {msg}"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
            Self::Expired(msg) => write!(f, "expired: {msg}"),
            Self::OperationFailed(msg) => write!(f, "operation failed: {msg}"),
            Self::OperationTimeout(msg) => write!(f, "operation timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Network(msg) => write!(f, "network: {msg}"),
            // Remote messages already carry the server-side prefix.
            Self::Remote(msg) => write!(f, "{msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
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

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
