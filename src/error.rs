//! Error types for the Courier messaging runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Machine-readable failure code carried on failed responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    Timeout,
    NetworkError,
    HttpError,
    ParseError,
    PermissionMissing,
    UnknownType,
    InternalError,
    TransportError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::HttpError => "http_error",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::PermissionMissing => "permission_missing",
            ErrorKind::UnknownType => "unknown_type",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::TransportError => "transport_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Failed to encode value for key {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// Runtime errors raised on either side of the isolation boundary
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Validation(String),

    #[error("Timeout")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}")]
    Http { status: u16 },

    #[error("Invalid JSON response: {0}")]
    Parse(String),

    #[error("Permission missing for origin {0}")]
    PermissionMissing(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Transport unavailable: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RuntimeError {
    /// Failure code reported to the unprivileged side
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Validation(_) | RuntimeError::Config(_) => ErrorKind::ValidationError,
            RuntimeError::Timeout => ErrorKind::Timeout,
            RuntimeError::Network(_) => ErrorKind::NetworkError,
            RuntimeError::Http { .. } => ErrorKind::HttpError,
            RuntimeError::Parse(_) => ErrorKind::ParseError,
            RuntimeError::PermissionMissing(_) => ErrorKind::PermissionMissing,
            RuntimeError::Internal(_) | RuntimeError::Storage(_) => ErrorKind::InternalError,
            RuntimeError::Transport(_) => ErrorKind::TransportError,
        }
    }

    /// HTTP status attached to the failure, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            RuntimeError::Http { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for RuntimeError {
    fn from(err: config::ConfigError) -> Self {
        RuntimeError::Config(err.to_string())
    }
}
