//! HTTP request handlers for the herald admin API.
//!
//! Handlers are grouped by functionality:
//! - `delivery` - status, listings and forced retries of pending events
//! - `events` - producer submission
//! - `health` - liveness probe with pending count
//!
//! Every failure is returned as `{"error": {"code", "message"}}` with a
//! matching status code.

pub mod delivery;
pub mod events;
pub mod health;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_delivery::{DeliveryError, ErrorCategory};
use serde::Serialize;
use tracing::error;

pub use delivery::{get_delivery_status, get_event, list_events, list_failed, retry_all, retry_event};
pub use events::submit_event;
pub use health::health_check;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Handler failure mapped to a status code and error body.
#[derive(Debug)]
pub enum ApiError {
    /// Requested event is neither pending nor archived.
    NotFound(String),
    /// Request body or parameters are invalid.
    BadRequest(String),
    /// Unexpected failure inside the manager.
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message),
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "invalid_request", message),
            Self::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        let body = ErrorResponse {
            error: ErrorDetail { code: code.to_string(), message: message.to_string() },
        };
        (status, Json(body)).into_response()
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::EventNotFound { .. } => {
                Self::NotFound("Event not found or already completed".to_string())
            },
            other => {
                error!(error = %other, category = %ErrorCategory::from(&other), "admin request failed");
                Self::Internal(other.to_string())
            },
        }
    }
}
