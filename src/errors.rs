//! Error types shared across the supervisor.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering the hard failure modes.
///
/// Command timeouts, foreign-process kill failures and exhausted shutdown
/// escalation are deliberately absent: they are reported through
/// [`CommandResult`](crate::models::command::CommandResult),
/// [`AuditAction`](crate::orchestrator::supervisor::AuditAction) and
/// [`CloseOutcome`](crate::orchestrator::session::CloseOutcome) instead.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// The external tool could not be launched (binary missing, permission
    /// denied, working directory could not be created).
    SpawnFailed(String),
    /// The peer closed the pipe, or this side already closed its handle.
    ChannelClosed(String),
    /// The session could not be (re)started to serve a command.
    SessionUnavailable(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// The configured concurrent session cap has been reached.
    LimitReached(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::SpawnFailed(msg) => write!(f, "spawn failed: {msg}"),
            Self::ChannelClosed(msg) => write!(f, "channel closed: {msg}"),
            Self::SessionUnavailable(msg) => write!(f, "session unavailable: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::LimitReached(msg) => write!(f, "limit reached: {msg}"),
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
