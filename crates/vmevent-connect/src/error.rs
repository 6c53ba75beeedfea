//! Error types for vmevent-connect
//!
//! `ConnectorError` is what adapters, sinks and stores return. `ConnectError` is the
//! runtime-level error surfaced by the runner and the binary.

use std::fmt;
use thiserror::Error;

/// Result type alias for the runtime
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Result type alias for connector operations
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Runtime error
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connector failed
    #[error("Connector '{name}' error: {message}")]
    Source { name: String, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

/// Errors that can occur in connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection to the vendor API or the sink failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Login rejected by the vendor API
    #[error("authentication failed with status {status}")]
    Auth { status: u16 },

    /// The refresh token itself has expired; a full login is required
    #[error("refresh token expired")]
    RefreshExpired,

    /// Request still unauthorized after re-authentication
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Horizon answered 409: the event database is not configured
    #[error("event backing store not initialized")]
    BackingStoreUninitialized,

    /// Non-success status that has no dedicated meaning
    #[error("unexpected status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    /// vSphere session is gone (NotAuthenticated fault)
    #[error("session expired: {0}")]
    SessionExpired(String),

    /// SOAP fault or malformed vendor response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Event could not be turned into a normalized envelope
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Sink refused the event (Nack)
    #[error("sink rejected event: {0}")]
    Rejected(String),

    /// Data serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Checkpoint store error
    #[error("state error: {0}")]
    State(String),

    /// Timeout waiting for response
    #[error("timeout: {0}")]
    Timeout(String),

    /// Fatal error that will not succeed on retry
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Cancellation was requested
    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("xml error: {0}")]
    Xml(String),
}

impl ConnectorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::UnexpectedStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Errors after which the polling loop must stop instead of backing off
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Fatal(_) | Self::Cancelled(_) => true,
            // rejected credentials; a 5xx on login is the server's problem
            Self::Auth { status } => (400..500).contains(status),
            _ => false,
        }
    }

    /// Check if this is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_decode() || e.is_builder() {
            Self::Serialization(e.to_string())
        } else {
            Self::Connection(e.to_string())
        }
    }
}

impl From<quick_xml::Error> for ConnectorError {
    fn from(e: quick_xml::Error) -> Self {
        Self::Xml(e.to_string())
    }
}

impl From<quick_xml::DeError> for ConnectorError {
    fn from(e: quick_xml::DeError) -> Self {
        Self::Xml(e.to_string())
    }
}

impl ConnectError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn source(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Source {
            name: name.into(),
            message: msg.into(),
        }
    }
}

/// Connector status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConnectError::source("horizon", "login refused");
        assert_eq!(err.to_string(), "Connector 'horizon' error: login refused");
        assert_eq!(
            ConnectorError::Auth { status: 403 }.to_string(),
            "authentication failed with status 403"
        );
    }

    #[test]
    fn test_connector_error_retryable() {
        assert!(ConnectorError::Connection("reset".to_string()).is_retryable());
        assert!(ConnectorError::Timeout("30s".to_string()).is_retryable());
        assert!(ConnectorError::UnexpectedStatus {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(ConnectorError::UnexpectedStatus {
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(!ConnectorError::UnexpectedStatus {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!ConnectorError::RefreshExpired.is_retryable());
        assert!(!ConnectorError::BackingStoreUninitialized.is_retryable());
    }

    #[test]
    fn test_fatal_and_cancelled() {
        assert!(ConnectorError::Auth { status: 401 }.is_fatal());
        assert!(!ConnectorError::Auth { status: 503 }.is_fatal());
        assert!(!ConnectorError::Unauthorized("again".to_string()).is_fatal());

        let err = ConnectError::from(ConnectorError::Cancelled("ctrl-c".to_string()));
        assert!(matches!(err, ConnectError::Connector(ref e) if e.is_cancelled()));
        assert_eq!(err.to_string(), "cancelled: ctrl-c");
    }
}
