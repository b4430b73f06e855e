use std::fmt::Display;
use std::panic::Location;
use thiserror::Error;

/// Unified error type for composition and store operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    /// Malformed operator or value, missing placeholder, wrong arity
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No rows or documents matched
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate unique key
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Opaque error surfaced by a store client
    #[error("Upstream error ({caller}): {message}")]
    Upstream { caller: String, message: String },

    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Invalid or missing configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation not supported by this backend
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DataError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        DataError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DataError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        DataError::Conflict(msg.into())
    }

    pub fn operation_not_supported(msg: impl Into<String>) -> Self {
        DataError::OperationNotSupported(msg.into())
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        DataError::InvalidConfiguration(msg.into())
    }

    /// Wrap a store error, tagging it with the `file:line` of the call site
    #[track_caller]
    pub fn upstream(err: impl Display) -> Self {
        let location = Location::caller();
        DataError::Upstream {
            caller: format!("{}:{}", location.file(), location.line()),
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DataError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DataError::Conflict(_))
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, DataError::InvalidArgument(_))
    }
}

impl From<serde_json::Error> for DataError {
    fn from(e: serde_json::Error) -> Self {
        DataError::Serialization(e.to_string())
    }
}

impl From<::config::ConfigError> for DataError {
    fn from(e: ::config::ConfigError) -> Self {
        DataError::InvalidConfiguration(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
