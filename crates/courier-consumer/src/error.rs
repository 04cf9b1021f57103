//! Error types for the event consumer.

use std::time::Duration;

use courier_delivery::DeliveryError;
use thiserror::Error;

/// Result type alias for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Error types for consuming and processing log messages.
#[derive(Debug, Clone, Error)]
pub enum ConsumerError {
    /// Message cannot be turned into an event.
    #[error("malformed message: {message}")]
    MalformedMessage {
        /// What is wrong with the message
        message: String,
    },

    /// Event processing failed at the infrastructure level.
    #[error("processing failed: {message}")]
    Processing {
        /// Processing error message
        message: String,
    },

    /// Fetching from or committing to the event log failed.
    #[error("event source error: {message}")]
    Source {
        /// Source error message
        message: String,
    },

    /// Publishing to the dead-letter destination failed.
    #[error("dead-letter publish failed: {message}")]
    DeadLetter {
        /// Publish error message
        message: String,
    },

    /// A consumer task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Task that panicked
        worker_id: usize,
        /// Panic message
        error: String,
    },

    /// Shutdown did not finish in time.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Configured timeout
        timeout: Duration,
    },
}

impl ConsumerError {
    /// Creates a malformed message error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage { message: message.into() }
    }

    /// Creates a processing error.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing { message: message.into() }
    }

    /// Creates an event source error.
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source { message: message.into() }
    }

    /// Creates a dead-letter error.
    pub fn dead_letter(message: impl Into<String>) -> Self {
        Self::DeadLetter { message: message.into() }
    }

    /// Returns true if the message should go straight to the dead-letter
    /// destination instead of being retried.
    pub fn is_dead_letter(&self) -> bool {
        matches!(self, Self::MalformedMessage { .. })
    }
}

impl From<DeliveryError> for ConsumerError {
    fn from(error: DeliveryError) -> Self {
        if error.is_transient() {
            Self::processing(error.to_string())
        } else {
            Self::malformed(error.to_string())
        }
    }
}
