//! Error types for the scopes middleware.
//!
//! Usage errors (empty ids, duplicates, missing entries) are reported to the
//! immediate caller and leave the adapter untouched. Infrastructure failures
//! move the adapter to `Failed` and are remembered, so every later
//! `BadState` error chains back to the original cause through
//! [`std::error::Error::source`].

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::adapter::AdapterState;

/// Main error type for the middleware.
#[derive(Debug, Error)]
pub enum MiddlewareError {
    // Usage errors
    #[error("{message}")]
    InvalidArgument { message: String },

    #[error("{message}")]
    AlreadyInUse { message: String },

    #[error("{message}")]
    NotFound { message: String },

    // Lifecycle errors
    #[error("{label}: Object adapter in {state} state (adapter: {adapter})")]
    BadState {
        label: String,
        state: AdapterState,
        adapter: String,
        /// Fault recorded when the adapter entered `Failed`, if any
        #[source]
        cause: Option<Arc<MiddlewareError>>,
    },

    // Infrastructure errors
    /// A remembered fault, shared with the adapter that recorded it.
    #[error(transparent)]
    Shared(Arc<MiddlewareError>),

    #[error("safe_bind(): address in use: {endpoint}")]
    AddressInUse { endpoint: String },

    #[error("ObjectAdapter: broker thread failure (adapter: {adapter})")]
    BrokerFailure {
        adapter: String,
        #[source]
        source: Box<MiddlewareError>,
    },

    #[error("ObjectAdapter: worker thread failure (adapter: {adapter}): {message}")]
    WorkerFailure { adapter: String, message: String },

    // Remote errors, raised on the client side of a twoway invocation
    #[error("{message}")]
    Unknown { message: String },

    #[error(
        "Object does not exist (adapter: {adapter}, endpoint: {endpoint}, identity: {identity})"
    )]
    ObjectNotExist {
        endpoint: String,
        identity: String,
        category: String,
        adapter: String,
    },

    #[error(
        "Operation does not exist (adapter: {adapter}, endpoint: {endpoint}, identity: {identity}, op: {op_name})"
    )]
    OperationNotExist {
        endpoint: String,
        identity: String,
        category: String,
        adapter: String,
        op_name: String,
    },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Transport and codec errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for middleware operations.
pub type Result<T> = std::result::Result<T, MiddlewareError>;

impl From<std::io::Error> for MiddlewareError {
    fn from(err: std::io::Error) -> Self {
        MiddlewareError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for MiddlewareError {
    fn from(err: serde_json::Error) -> Self {
        MiddlewareError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl MiddlewareError {
    /// Create an invalid-argument error from a message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        MiddlewareError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create an I/O error carrying only a description.
    pub fn io(message: impl Into<String>) -> Self {
        MiddlewareError::Io {
            message: message.into(),
            source: None,
        }
    }

    /// True for errors raised because the adapter is Destroyed or Failed.
    pub fn is_bad_state(&self) -> bool {
        matches!(self, MiddlewareError::BadState { .. })
    }

    /// True if this error, or any error in its source chain, is a double bind.
    pub fn is_address_in_use(&self) -> bool {
        match self {
            MiddlewareError::AddressInUse { .. } => true,
            MiddlewareError::BrokerFailure { source, .. } => source.is_address_in_use(),
            MiddlewareError::Shared(inner) => inner.is_address_in_use(),
            MiddlewareError::BadState {
                cause: Some(cause), ..
            } => cause.is_address_in_use(),
            _ => false,
        }
    }

    /// True for errors reported back by a remote adapter.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            MiddlewareError::Unknown { .. }
                | MiddlewareError::ObjectNotExist { .. }
                | MiddlewareError::OperationNotExist { .. }
        )
    }
}
