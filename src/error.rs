use thiserror::Error;

/// Errors surfaced by the broker to a single client connection.
///
/// Every variant maps to a stable machine-readable code that is sent over the
/// wire in `error` events. `SessionDead` is the only condition that is also
/// announced to every connection (as `session:exited`).
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("path escapes the workspace: {0}")]
    PathEscape(String),

    #[error("no such file: {0}")]
    NotFound(String),

    #[error("failed to write {path}: {source}")]
    WriteFailure {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    ReadFailure {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shell session has exited")]
    SessionDead,

    #[error("shell input queue is full")]
    InputBackpressure,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("too many requests pending for this connection")]
    TooManyRequests,

    #[error("broker is not running")]
    Unavailable,
}

impl BrokerError {
    /// Machine-readable error code used in wire payloads.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::PathEscape(_) => "path_escape",
            BrokerError::NotFound(_) => "not_found",
            BrokerError::WriteFailure { .. } => "write_failed",
            BrokerError::ReadFailure { .. } => "read_failed",
            BrokerError::SessionDead => "session_dead",
            BrokerError::InputBackpressure => "input_backpressure",
            BrokerError::InvalidMessage(_) => "invalid_message",
            BrokerError::TooManyRequests => "too_many_requests",
            BrokerError::Unavailable => "broker_unavailable",
        }
    }
}
