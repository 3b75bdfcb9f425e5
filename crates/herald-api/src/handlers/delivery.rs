//! Delivery inspection and forced retry handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use herald_core::{DeliveryEvent, EventId};
use herald_delivery::{ManagerStatus, RetryTrigger};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::ApiError;
use crate::AppState;

/// Page size used when `limit` is absent, unparsable or not positive.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Query parameters for event listings.
///
/// `limit` is kept as text so that a malformed value falls back to the
/// default instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Only events of this tenant. Also accepted as `user_id`.
    #[serde(alias = "user_id")]
    pub tenant_id: Option<String>,
    /// Maximum number of events returned.
    pub limit: Option<String>,
}

impl ListParams {
    fn limit(&self) -> usize {
        parse_limit(self.limit.as_deref())
    }
}

fn parse_limit(raw: Option<&str>) -> usize {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|limit| *limit > 0)
        .and_then(|limit| usize::try_from(limit).ok())
        .unwrap_or(DEFAULT_LIST_LIMIT)
}

/// Body of `GET /delivery/status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Always `running` while the server answers.
    pub status: &'static str,
    /// Manager snapshot.
    #[serde(flatten)]
    pub manager: ManagerStatus,
}

/// Body of `GET /delivery/events`.
#[derive(Debug, Serialize)]
pub struct EventListResponse {
    /// All pending events.
    pub total_pending: usize,
    /// Pending events matching the tenant filter.
    pub filtered_count: usize,
    /// Events included in this response.
    pub shown_count: usize,
    /// Matching events, oldest first.
    pub events: Vec<DeliveryEvent>,
}

/// Body of `GET /delivery/failed`.
#[derive(Debug, Serialize)]
pub struct FailedListResponse {
    /// Events included in this response.
    pub count: usize,
    /// Archived failures, most recent first.
    pub events: Vec<DeliveryEvent>,
}

/// Body of the retry endpoints.
#[derive(Debug, Serialize)]
pub struct RetryResponse {
    /// `dispatched`, `in_flight`, `deferred` or `swept`.
    pub status: &'static str,
    /// Retried event, absent for sweeps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    /// Cycles started by a sweep.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatched: Option<usize>,
}

impl From<RetryTrigger> for RetryResponse {
    fn from(trigger: RetryTrigger) -> Self {
        match trigger {
            RetryTrigger::Dispatched { event_id } => {
                Self { status: "dispatched", event_id: Some(event_id), dispatched: None }
            },
            RetryTrigger::AlreadyInFlight { event_id } => {
                Self { status: "in_flight", event_id: Some(event_id), dispatched: None }
            },
            RetryTrigger::Deferred { event_id } => {
                Self { status: "deferred", event_id: Some(event_id), dispatched: None }
            },
            RetryTrigger::Swept { dispatched } => {
                Self { status: "swept", event_id: None, dispatched: Some(dispatched) }
            },
        }
    }
}

/// Overall delivery status and counters.
#[instrument(name = "delivery_status", skip(state))]
pub async fn get_delivery_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let manager = state.manager.status().await;
    debug!(pending_events = manager.pending_events, in_flight = manager.in_flight, "status requested");
    Json(StatusResponse { status: "running", manager })
}

/// Single pending event.
///
/// # Errors
///
/// 404 when the event is unknown or already delivered or failed.
#[instrument(name = "get_event", skip(state))]
pub async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<DeliveryEvent>, ApiError> {
    state
        .manager
        .get_status(&EventId::from(event_id))
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Event not found or already completed".to_string()))
}

/// Pending events, optionally filtered by tenant.
#[instrument(name = "list_events", skip(state))]
pub async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<EventListResponse> {
    let tenant_id = params.tenant_id.as_deref().map(str::trim).filter(|id| !id.is_empty());
    let listing = state.manager.list_pending(tenant_id, params.limit()).await;

    Json(EventListResponse {
        total_pending: listing.total_pending,
        filtered_count: listing.filtered_count,
        shown_count: listing.events.len(),
        events: listing.events,
    })
}

/// Events that exhausted their retries.
#[instrument(name = "list_failed", skip(state))]
pub async fn list_failed(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<FailedListResponse> {
    let events = state.manager.list_failed(params.limit()).await;
    Json(FailedListResponse { count: events.len(), events })
}

/// Sweeps every pending event that is due.
///
/// # Errors
///
/// 500 if the manager reports an unexpected failure.
#[instrument(name = "retry_all", skip(state))]
pub async fn retry_all(State(state): State<AppState>) -> Result<Response, ApiError> {
    let trigger = state.manager.force_retry(None).await?;
    info!(?trigger, "forced retry sweep via admin api");
    Ok((StatusCode::ACCEPTED, Json(RetryResponse::from(trigger))).into_response())
}

/// Resets one event's attempts and re-dispatches it.
///
/// # Errors
///
/// 404 when the event is neither pending nor archived.
#[instrument(name = "retry_event", skip(state))]
pub async fn retry_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Response, ApiError> {
    let trigger = state.manager.force_retry(Some(&EventId::from(event_id))).await?;
    info!(?trigger, "forced retry via admin api");
    Ok((StatusCode::ACCEPTED, Json(RetryResponse::from(trigger))).into_response())
}
