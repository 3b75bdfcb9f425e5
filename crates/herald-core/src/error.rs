//! Error types for core model operations.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while building or decoding domain models.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Payload could not be serialized into the delivery body.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Event fields violate a model constraint.
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
