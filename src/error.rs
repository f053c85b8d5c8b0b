//! Error handling for probewatch
//!
//! Every probe reports through a single [`ProbeError`] so the caller can treat
//! argument, transport, protocol and assertion failures uniformly. The parser,
//! the job queue and the configuration loader each get their own enum.

use std::time::Duration;
use thiserror::Error;

/// Main error type returned from a probe run
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Missing or unusable argument, detected before any network I/O
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout error after {0:?}")]
    TimeoutError(Duration),

    #[error("IO error: {0}")]
    IoError(std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    /// Unexpected response from the remote service
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The interaction worked but the outcome differed from the expectation
    #[error("{0}")]
    Mismatch(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for probe operations
pub type ProbeResult<T> = Result<T, ProbeError>;

impl ProbeError {
    /// Whether this failure was raised before any network activity
    pub fn is_argument_error(&self) -> bool {
        matches!(self, ProbeError::InvalidArgument(_))
    }

    /// Convert a socket error raised under a deadline, so expiries read as timeouts
    pub fn from_io(e: std::io::Error, deadline: Duration) -> Self {
        if is_timeout_kind(e.kind()) {
            ProbeError::TimeoutError(deadline)
        } else {
            ProbeError::IoError(e)
        }
    }

    /// Whether this failure is a deadline expiry
    pub fn is_timeout(&self) -> bool {
        match self {
            ProbeError::TimeoutError(_) => true,
            ProbeError::IoError(e) => is_timeout_kind(e.kind()),
            _ => false,
        }
    }
}

// Socket deadlines surface as `WouldBlock` on unix and `TimedOut` elsewhere
fn is_timeout_kind(kind: std::io::ErrorKind) -> bool {
    matches!(kind, std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock)
}

impl From<std::io::Error> for ProbeError {
    fn from(e: std::io::Error) -> Self {
        ProbeError::IoError(e)
    }
}

impl From<std::num::ParseIntError> for ProbeError {
    fn from(e: std::num::ParseIntError) -> Self {
        ProbeError::InvalidArgument(e.to_string())
    }
}

impl From<openssl::error::ErrorStack> for ProbeError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        ProbeError::TlsError(e.to_string())
    }
}

impl From<hickory_proto::error::ProtoError> for ProbeError {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        ProbeError::ProtocolError(e.to_string())
    }
}

impl From<tokio::task::JoinError> for ProbeError {
    fn from(e: tokio::task::JoinError) -> Self {
        ProbeError::Internal(e.to_string())
    }
}

/// Errors raised while turning declarative lines into tests
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: unknown protocol '{protocol}' (known: {known})")]
    UnknownProtocol {
        line: usize,
        protocol: String,
        known: String,
    },

    #[error("line {line}: protocol '{protocol}' does not accept argument '{argument}'")]
    UnknownArgument {
        line: usize,
        protocol: String,
        argument: String,
    },

    #[error("line {line}: value '{value}' for argument '{argument}' does not match '{pattern}'")]
    InvalidValue {
        line: usize,
        argument: String,
        value: String,
        pattern: String,
    },

    #[error("failed to read {source_name}: {error}")]
    Read {
        source_name: String,
        error: std::io::Error,
    },
}

/// Errors from the job queue backend
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue connection failed: {0}")]
    Connection(String),

    #[error("Queue command failed: {0}")]
    Command(String),

    #[error("Queue connection timed out after {0:?}")]
    Timeout(Duration),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_timeout() {
            QueueError::Command(format!("timeout: {}", e))
        } else if e.is_connection_refusal() || e.is_io_error() {
            QueueError::Connection(e.to_string())
        } else {
            QueueError::Command(e.to_string())
        }
    }
}

/// Errors from loading the layered configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {error}")]
    Read { path: String, error: std::io::Error },

    #[error("Failed to parse configuration file {path}: {error}")]
    Parse {
        path: String,
        error: serde_json::Error,
    },

    #[error("Invalid value for {flag}: {message}")]
    InvalidValue { flag: String, message: String },
}
