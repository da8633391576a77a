//! Error types for the coordination store

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the store Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the coordination store
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("Connection error ({address}): {message}")]
    Connection { address: String, message: String },

    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    // Blocking predicates
    #[error("Operation timeout: {operation} after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Invalid value for key {key}: {message}")]
    InvalidValue { key: String, message: String },

    // Protocol errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification callers can match on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport broken or refused
    Connection,

    /// A blocking predicate was not satisfied before the deadline
    Timeout,

    /// Bad configuration or a value that cannot be used as requested
    Configuration,

    /// Malformed or unexpected message
    Protocol,
}

impl Error {
    /// Shorthand for a connection error against `address`
    pub fn connection(address: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Connection {
            address: address.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection { .. } | Error::ChannelClosed { .. } | Error::Io(_) => {
                ErrorKind::Connection
            }
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::InvalidConfig { .. } | Error::InvalidValue { .. } => ErrorKind::Configuration,
            Error::Protocol { .. } | Error::Serialization(_) | Error::Internal { .. } => {
                ErrorKind::Protocol
            }
        }
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection { .. } | Error::Timeout { .. })
    }

    /// Returns true if this error leaves the connection unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. }
                | Error::Serialization(_)
                | Error::ChannelClosed { .. }
                | Error::Internal { .. }
        )
    }

    /// Convert into the form carried in a response frame
    pub fn to_wire(&self) -> WireError {
        let message = match self {
            Error::Timeout { operation, timeout_ms } => {
                return WireError {
                    kind: ErrorKind::Timeout,
                    message: operation.clone(),
                    timeout_ms: Some(*timeout_ms),
                    key: None,
                }
            }
            Error::InvalidValue { key, message } => {
                return WireError {
                    kind: ErrorKind::Configuration,
                    message: message.clone(),
                    timeout_ms: None,
                    key: Some(key.clone()),
                }
            }
            Error::InvalidConfig { message } | Error::Protocol { message } => message.clone(),
            other => other.to_string(),
        };

        WireError {
            kind: self.kind(),
            message,
            timeout_ms: None,
            key: None,
        }
    }
}

/// Error as carried across the wire in a response frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    pub timeout_ms: Option<u64>,
    pub key: Option<String>,
}

impl WireError {
    /// Rebuild a local error; `address` names the peer for connection errors
    pub fn into_error(self, address: &str) -> Error {
        match self.kind {
            ErrorKind::Timeout => Error::Timeout {
                operation: self.message,
                timeout_ms: self.timeout_ms.unwrap_or_default(),
            },
            ErrorKind::Configuration => match self.key {
                Some(key) => Error::InvalidValue {
                    key,
                    message: self.message,
                },
                None => Error::InvalidConfig {
                    message: self.message,
                },
            },
            ErrorKind::Connection => Error::connection(address, self.message),
            ErrorKind::Protocol => Error::protocol(self.message),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
