//! Delivery domain models and strongly-typed identifiers.
//!
//! Defines the delivery event record tracked by the delivery manager, the
//! per-channel attempt result, and newtype wrappers for event and tenant ids.
//!
//! # Event Lifecycle
//!
//! ```text
//! Pending ──(all dispatched channels succeeded)──▶ Delivered
//!    │
//!    └──(attempt_count >= max_retries, a channel still failing)──▶ Failed
//! ```
//!
//! Both terminal states remove the event from pending tracking.

use std::{collections::BTreeSet, fmt, path::PathBuf, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Identifier of a delivery event.
///
/// Producers may supply their own id. When left empty the delivery manager
/// generates one in the form `<tenant_id>_<creation_nanos>`.
///
/// # Example
///
/// ```
/// use herald_core::models::{EventId, TenantId};
///
/// let id = EventId::generate(&TenantId::from("acme"), 1_700_000_000_000_000_000);
/// assert_eq!(id.as_str(), "acme_1700000000000000000");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Builds an id from the owning tenant and the creation timestamp.
    pub fn generate(tenant_id: &TenantId, creation_nanos: i64) -> Self {
        Self(format!("{tenant_id}_{creation_nanos}"))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when no id has been assigned yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of the tenant (gateway instance) that owns an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Delivery status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting for a fan-out cycle to succeed.
    Pending,

    /// Every dispatched channel accepted the event.
    ///
    /// Terminal success state.
    Delivered,

    /// Retries exhausted with at least one channel still failing.
    ///
    /// Terminal failure state.
    Failed,
}

impl DeliveryStatus {
    /// Returns true for `Delivered` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Destination type an event can be delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    /// Webhook configured for the event's tenant.
    #[serde(rename = "webhook")]
    UserWebhook,
    /// Process-wide webhook receiving every tenant's events.
    #[serde(rename = "global_webhook")]
    GlobalWebhook,
    /// Message broker publication.
    #[serde(rename = "broker")]
    Broker,
}

impl Channel {
    /// All channels in dispatch order.
    pub const ALL: [Self; 3] = [Self::UserWebhook, Self::GlobalWebhook, Self::Broker];

    /// Stable channel name used in logs and API responses.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserWebhook => "webhook",
            Self::GlobalWebhook => "global_webhook",
            Self::Broker => "broker",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain event tracked through its delivery attempt series.
///
/// `payload` and `body` are captured once when the event is built and are
/// never mutated afterwards. Channel adapters only ever see shared snapshots
/// of this record; lifecycle fields are updated by the delivery manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    /// Unique event id, empty until assigned.
    pub id: EventId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Opaque token resolving tenant-specific destinations.
    pub auth_token: String,
    /// Domain event name, e.g. `Message` or `ReadReceipt`.
    pub event_type: String,
    /// Structured event content.
    pub payload: serde_json::Value,
    /// Serialized event content sent to every channel.
    #[serde(with = "body_base64")]
    pub body: Bytes,
    /// File delivered alongside the event by webhook channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_file: Option<PathBuf>,
    /// When the event was submitted.
    pub created_at: DateTime<Utc>,
    /// Number of completed fan-out cycles.
    pub attempt_count: u32,
    /// Current delivery status.
    pub status: DeliveryStatus,
    /// Most recent channel error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the last fan-out cycle completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest time of the next retry under backoff policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Channels that accepted the event in some cycle of this series.
    #[serde(default)]
    pub delivered_channels: BTreeSet<Channel>,
}

impl DeliveryEvent {
    /// Creates an event, serializing `payload` as its delivery body.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidEvent` when the tenant id is empty and
    /// `CoreError::Serialization` when the payload cannot be encoded.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        auth_token: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Self> {
        let body = Bytes::from(serde_json::to_vec(&payload)?);
        Self::with_serialized_body(tenant_id, auth_token, event_type, payload, body)
    }

    /// Creates an event whose delivery body was serialized by the producer.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidEvent` when the tenant id is empty.
    pub fn with_serialized_body(
        tenant_id: impl Into<TenantId>,
        auth_token: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        body: Bytes,
    ) -> Result<Self> {
        let tenant_id = tenant_id.into();
        if tenant_id.as_str().trim().is_empty() {
            return Err(CoreError::InvalidEvent("tenant id must not be empty".to_string()));
        }

        Ok(Self {
            id: EventId::default(),
            tenant_id,
            auth_token: auth_token.into(),
            event_type: event_type.into(),
            payload,
            body,
            attached_file: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            attempt_count: 0,
            status: DeliveryStatus::Pending,
            last_error: None,
            last_attempt_at: None,
            next_attempt_at: None,
            delivered_channels: BTreeSet::new(),
        })
    }

    /// Sets a caller-chosen id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = id.into();
        self
    }

    /// Attaches a file for webhook channels to upload.
    #[must_use]
    pub fn with_attached_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.attached_file = Some(path.into());
        self
    }

    /// Returns the delivery body as UTF-8 text, replacing invalid sequences.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Time elapsed between submission and `now`, zero if `now` is earlier.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}

/// Outcome of delivering one event to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Channel the attempt targeted.
    pub channel: Channel,
    /// Whether the destination accepted the event.
    pub success: bool,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempt duration.
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    /// When the attempt started.
    pub timestamp: DateTime<Utc>,
}

impl DeliveryResult {
    /// Creates a successful result.
    pub fn succeeded(channel: Channel, started_at: DateTime<Utc>, duration: Duration) -> Self {
        Self { channel, success: true, error: None, duration, timestamp: started_at }
    }

    /// Creates a failed result carrying the error description.
    pub fn failed(
        channel: Channel,
        started_at: DateTime<Utc>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self { channel, success: false, error: Some(error.into()), duration, timestamp: started_at }
    }
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_event() -> DeliveryEvent {
        DeliveryEvent::new("tenant-1", "token-1", "Message", json!({"text": "hello"}))
            .expect("valid event")
    }

    #[test]
    fn generated_id_combines_tenant_and_nanos() {
        let id = EventId::generate(&TenantId::from("t1"), 42);
        assert_eq!(id.to_string(), "t1_42");
        assert!(!id.is_empty());
        assert!(EventId::default().is_empty());
    }

    #[test]
    fn new_event_serializes_payload_into_body() {
        let event = sample_event();
        assert_eq!(event.body_text(), r#"{"text":"hello"}"#);
        assert_eq!(event.status, DeliveryStatus::Pending);
        assert_eq!(event.attempt_count, 0);
        assert!(event.id.is_empty());
    }

    #[test]
    fn empty_tenant_rejected() {
        let result = DeliveryEvent::new("  ", "token", "Message", json!({}));
        assert!(matches!(result, Err(CoreError::InvalidEvent(_))));
    }

    #[test]
    fn event_json_encodes_body_as_base64() {
        let event = sample_event().with_id("fixed").with_attached_file("/tmp/audio.ogg");
        let value = serde_json::to_value(&event).expect("serializes");

        assert_eq!(value["id"], "fixed");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["body"], "eyJ0ZXh0IjoiaGVsbG8ifQ==");
        assert_eq!(value["attached_file"], "/tmp/audio.ogg");

        let decoded: DeliveryEvent = serde_json::from_value(value).expect("deserializes");
        assert_eq!(decoded, event);
    }

    #[test]
    fn channel_names_match_wire_format() {
        assert_eq!(Channel::UserWebhook.as_str(), "webhook");
        assert_eq!(serde_json::to_value(Channel::GlobalWebhook).unwrap(), "global_webhook");
        assert_eq!(Channel::Broker.to_string(), "broker");
    }

    #[test]
    fn terminal_statuses() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
    }

    #[test]
    fn result_duration_serialized_in_millis() {
        let result = DeliveryResult::failed(
            Channel::Broker,
            Utc::now(),
            Duration::from_millis(1500),
            "broker unavailable",
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["duration_ms"], 1500);
        assert_eq!(value["channel"], "broker");
        assert_eq!(value["success"], false);
    }

    #[test]
    fn age_never_negative() {
        let mut event = sample_event();
        event.created_at = Utc::now();
        let earlier = event.created_at - chrono::Duration::seconds(5);
        assert_eq!(event.age(earlier), Duration::ZERO);
        let later = event.created_at + chrono::Duration::seconds(3);
        assert_eq!(event.age(later), Duration::from_secs(3));
    }
}
