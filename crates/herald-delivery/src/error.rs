//! Error types for event delivery operations.
//!
//! Channel transport failures, deadline expiry and administrative lookup
//! errors share one enum so that channel results, the manager and the admin
//! surface agree on wording. Each error maps to an [`ErrorCategory`] used as
//! a structured log field.

use std::fmt;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while delivering or administering events.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Single webhook call exceeded its timeout.
    #[error("request timeout after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Destination answered with a 4xx status.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Destination answered with a 5xx or other non-success status.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Broker publication failed.
    #[error("broker publish failed: {message}")]
    BrokerError {
        /// Publisher error message
        message: String,
    },

    /// The attempt deadline elapsed before the channel finished.
    #[error("context deadline exceeded before {channel} delivery completed")]
    ContextExpired {
        /// Channel that ran out of time
        channel: String,
    },

    /// All attempts failed.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// No pending or archived event carries the id.
    #[error("event {event_id} not found or already completed")]
    EventNotFound {
        /// Requested event id
        event_id: String,
    },

    /// Invalid manager or destination configuration.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Journal could not be read or written.
    #[error("journal error: {message}")]
    JournalError {
        /// Journal error message
        message: String,
    },

    /// Background tasks did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout_ms}ms")]
    ShutdownTimeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// A channel task panicked.
    #[error("{channel} delivery task panicked")]
    WorkerPanic {
        /// Channel whose task panicked
        channel: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a broker error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::BrokerError { message: message.into() }
    }

    /// Creates a deadline error for a channel.
    pub fn context_expired(channel: impl fmt::Display) -> Self {
        Self::ContextExpired { channel: channel.to_string() }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a not-found error.
    pub fn event_not_found(event_id: impl fmt::Display) -> Self {
        Self::EventNotFound { event_id: event_id.to_string() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a journal error.
    pub fn journal(message: impl Into<String>) -> Self {
        Self::JournalError { message: message.into() }
    }

    /// Creates a worker panic error.
    pub fn worker_panic(channel: impl fmt::Display) -> Self {
        Self::WorkerPanic { channel: channel.to_string() }
    }

    /// Returns true for transport failures that a later cycle may fix.
    ///
    /// Client errors are included: destinations are retried regardless of
    /// status class, matching at-least-once delivery with bounded attempts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. }
                | Self::Timeout { .. }
                | Self::ClientError { .. }
                | Self::ServerError { .. }
                | Self::BrokerError { .. }
                | Self::ContextExpired { .. }
                | Self::WorkerPanic { .. }
        )
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(err: std::io::Error) -> Self {
        Self::journal(err.to_string())
    }
}

/// Category of delivery error for log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues and call timeouts.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Broker publication failures.
    Broker,
    /// Attempt deadline expiry.
    Deadline,
    /// Lookups and exhausted retries.
    Lifecycle,
    /// Configuration problems.
    Configuration,
    /// Journal and shutdown failures.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::BrokerError { .. } => Self::Broker,
            DeliveryError::ContextExpired { .. } => Self::Deadline,
            DeliveryError::RetriesExhausted { .. } | DeliveryError::EventNotFound { .. } => {
                Self::Lifecycle
            },
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::JournalError { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Broker => write!(f, "broker"),
            Self::Deadline => write!(f, "deadline"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
