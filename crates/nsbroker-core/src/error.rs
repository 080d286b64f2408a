//! Error types for the namespace broker.
//!
//! Failures raised *inside* a namespace (a statement or expression that
//! errored) are data: they travel inside [`ExecResult`](crate::ExecResult)
//! fields and only become `RemoteExec`/`RemoteEval` errors when the client
//! façade unpacks a reply. Everything else here is a protocol or transport
//! fault.

use thiserror::Error;

/// Main error type for the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    // Handshake errors
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // Failures reported by the namespace itself
    #[error("Remote exec error:\n{0}")]
    RemoteExec(String),

    #[error("Remote eval error:\n{0}")]
    RemoteEval(String),

    // Namespace registration / lookup errors
    #[error("Namespace error: {message}")]
    Namespace { message: String },

    // Transport errors
    #[error("Connection lost to {peer}")]
    ConnectionLost { peer: String },

    #[error("Connect timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Addressing and configuration errors
    #[error("Invalid host spec \"{spec}\": {message}")]
    HostSpec { spec: String, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl BrokerError {
    /// Shorthand for a namespace error.
    pub fn namespace(message: impl Into<String>) -> Self {
        BrokerError::Namespace {
            message: message.into(),
        }
    }

    /// Shorthand for a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        BrokerError::Protocol {
            message: message.into(),
        }
    }

    /// Numeric status used in administrative replies and logs.
    ///
    /// - `0`: not an error class of its own
    /// - `-1`: namespace unknown or colliding
    /// - `-2`: authentication failed
    /// - `-3`: remote code or expression failed
    /// - `-4`: transport lost or timed out
    /// - `-5`: malformed input (protocol, JSON, host spec, config)
    /// - `-99`: anything else
    pub fn status_code(&self) -> i32 {
        match self {
            BrokerError::Namespace { .. } => -1,
            BrokerError::Authentication { .. } => -2,
            BrokerError::RemoteExec(_) | BrokerError::RemoteEval(_) => -3,
            BrokerError::ConnectionLost { .. }
            | BrokerError::Timeout(_)
            | BrokerError::Io { .. } => -4,
            BrokerError::Protocol { .. }
            | BrokerError::Json { .. }
            | BrokerError::HostSpec { .. }
            | BrokerError::Config { .. } => -5,
            BrokerError::Other(_) => -99,
        }
    }

    /// Check if the caller may retry on a fresh connection.
    ///
    /// A lost connection leaves the outcome unknown; the work may or may not
    /// have run on the far side.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionLost { .. } | BrokerError::Timeout(_)
        )
    }
}
