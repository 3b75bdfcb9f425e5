//! Liveness endpoint.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `healthy` while the server answers.
    pub status: &'static str,
    /// Events awaiting delivery or retry.
    pub pending_events: usize,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Service version information
    pub version: &'static str,
}

/// Health check endpoint handler.
///
/// Called frequently by orchestration systems, so it only reads the
/// pending count.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let pending_events = state.manager.count_pending().await;
    debug!(pending_events, "health check completed");

    Json(HealthResponse {
        status: "healthy",
        pending_events,
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
    })
}
