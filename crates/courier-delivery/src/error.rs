//! Error types for webhook delivery operations.
//!
//! Transport failures and non-2xx responses are not errors at this level:
//! the delivery client reports them inside `DeliveryResponse` so the retry
//! policy can act on them. The variants here cover what the dispatcher and
//! the retry scheduler can fail on themselves.

use std::fmt;

use courier_core::{CoreError, WebhookId};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Subscriber answered with a non-2xx status.
    #[error("endpoint returned HTTP {status_code}")]
    HttpStatus {
        /// HTTP status code
        status_code: u16,
    },

    /// Webhook or delivery store operation failed.
    #[error("store error: {message}")]
    StoreError {
        /// Store error message
        message: String,
    },

    /// Webhook does not exist or was deleted.
    #[error("webhook {webhook_id} not found")]
    WebhookNotFound {
        /// Requested webhook
        webhook_id: WebhookId,
    },

    /// Payload could not be serialized or a stored snapshot could not be read.
    #[error("payload serialization failed: {message}")]
    SerializationError {
        /// Serialization error message
        message: String,
    },

    /// Invalid client configuration.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an HTTP status error.
    pub fn http_status(status_code: u16) -> Self {
        Self::HttpStatus { status_code }
    }

    /// Creates a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::StoreError { message: message.into() }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Returns true if retrying the same operation later may succeed.
    ///
    /// Store outages are transient. A missing webhook or an unreadable
    /// payload will not fix itself.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::HttpStatus { .. }
            | Self::StoreError { .. } => true,

            Self::WebhookNotFound { .. }
            | Self::SerializationError { .. }
            | Self::ConfigurationError { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::Serialization(message) => Self::serialization(message),
            other => Self::store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization(error.to_string())
    }
}

/// Category of delivery error used as a structured log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues.
    Network,
    /// Subscriber answered non-2xx.
    Http,
    /// Store operations.
    Store,
    /// Missing webhook.
    NotFound,
    /// Payload problems.
    Serialization,
    /// Configuration problems.
    Configuration,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::HttpStatus { .. } => Self::Http,
            DeliveryError::StoreError { .. } => Self::Store,
            DeliveryError::WebhookNotFound { .. } => Self::NotFound,
            DeliveryError::SerializationError { .. } => Self::Serialization,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Http => write!(f, "http"),
            Self::Store => write!(f, "store"),
            Self::NotFound => write!(f, "not_found"),
            Self::Serialization => write!(f, "serialization"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}
