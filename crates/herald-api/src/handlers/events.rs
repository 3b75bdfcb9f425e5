//! Producer submission handler.

use std::path::{Path, PathBuf};

use axum::{extract::State, http::StatusCode, Json};
use herald_core::{DeliveryEvent, DeliveryStatus, EventId};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::ApiError;
use crate::AppState;

/// Request body for `POST /events`.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// Owning tenant.
    pub tenant_id: String,
    /// Token resolving the tenant's destinations.
    pub token: String,
    /// Domain event name.
    pub event_type: String,
    /// Arbitrary JSON content.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// File uploaded alongside the event by webhook channels. Must resolve
    /// under the configured attachment directory.
    #[serde(default)]
    pub file_path: Option<String>,
}

/// Response from a successful submission.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    /// Id under which the event can be queried.
    pub event_id: EventId,
    /// Status at acceptance, always `pending`.
    pub status: DeliveryStatus,
}

/// Accepts an event for asynchronous fan-out.
///
/// # Errors
///
/// 400 when the tenant id is empty, the payload cannot be encoded, or the
/// attachment lies outside the attachment directory.
#[instrument(
    name = "submit_event",
    skip(state, request),
    fields(tenant_id = %request.tenant_id, event_type = %request.event_type)
)]
pub async fn submit_event(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let mut event =
        DeliveryEvent::new(request.tenant_id, request.token, request.event_type, request.payload)
            .map_err(|e| {
                warn!(error = %e, "rejected event submission");
                ApiError::BadRequest(e.to_string())
            })?;

    if let Some(id) = request.id.filter(|id| !id.trim().is_empty()) {
        event = event.with_id(id);
    }
    if let Some(path) = request.file_path.filter(|path| !path.trim().is_empty()) {
        let path = resolve_attachment(state.attachment_dir.as_deref(), Path::new(&path))
            .await
            .inspect_err(|e| warn!(error = ?e, "rejected attachment"))?;
        event = event.with_attached_file(path);
    }

    let event_id = state.manager.submit(event).await;
    info!(event_id = %event_id, "event accepted via api");

    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { event_id, status: DeliveryStatus::Pending })))
}

/// Canonicalizes `path` and checks that it stays inside `dir`.
async fn resolve_attachment(dir: Option<&Path>, path: &Path) -> Result<PathBuf, ApiError> {
    let Some(dir) = dir else {
        return Err(ApiError::BadRequest("attachments are not enabled".to_string()));
    };

    let dir = tokio::fs::canonicalize(dir)
        .await
        .map_err(|_| ApiError::BadRequest("attachment directory is unavailable".to_string()))?;
    let candidate = if path.is_relative() { dir.join(path) } else { path.to_path_buf() };
    let resolved = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| ApiError::BadRequest("attachment not found".to_string()))?;

    let is_file = tokio::fs::metadata(&resolved).await.is_ok_and(|meta| meta.is_file());
    if !resolved.starts_with(&dir) || !is_file {
        return Err(ApiError::BadRequest(
            "attachment must be a file inside the attachment directory".to_string(),
        ));
    }
    Ok(resolved)
}
