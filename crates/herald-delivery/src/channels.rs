//! Channel adapters delivering one event snapshot to one destination.
//!
//! The [`ChannelDispatcher`] decides which channels an event is sent to
//! ([`ChannelDispatcher::plan`]) and performs a single delivery
//! ([`ChannelDispatcher::deliver`]). Adapters only perform network I/O and
//! always report a [`DeliveryResult`]; they never touch manager state.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use herald_core::{Channel, Clock, DeliveryEvent, DeliveryResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    client::{WebhookClient, WebhookRequest},
    destinations::{BrokerMessage, BrokerPublisher, DestinationResolver},
    error::{DeliveryError, ErrorCategory, Result},
};

/// Default timeout of a single webhook call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// A channel selected for one fan-out cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
    /// Destination type.
    pub channel: Channel,
    /// Webhook URL, `None` for the broker.
    pub url: Option<String>,
}

/// Plans and performs per-channel deliveries.
pub struct ChannelDispatcher {
    client: WebhookClient,
    destinations: Arc<dyn DestinationResolver>,
    broker: Arc<dyn BrokerPublisher>,
    global_webhook_url: Option<String>,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ChannelDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelDispatcher")
            .field("global_webhook_url", &self.global_webhook_url)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl ChannelDispatcher {
    /// Creates a dispatcher.
    ///
    /// An empty `global_webhook_url` disables the global webhook channel.
    pub fn new(
        client: WebhookClient,
        destinations: Arc<dyn DestinationResolver>,
        broker: Arc<dyn BrokerPublisher>,
        global_webhook_url: Option<String>,
        call_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let global_webhook_url =
            global_webhook_url.map(|url| url.trim().to_string()).filter(|url| !url.is_empty());
        Self { client, destinations, broker, global_webhook_url, call_timeout, clock }
    }

    /// Selects the channels that have a destination for `event`.
    ///
    /// Channels without a destination are skipped rather than failed.
    /// Channels listed in `skip` are left out as well.
    pub fn plan(&self, event: &DeliveryEvent, skip: &BTreeSet<Channel>) -> Vec<ChannelTarget> {
        let mut targets = Vec::with_capacity(Channel::ALL.len());

        if let Some(url) =
            self.destinations.webhook_url(&event.auth_token).filter(|url| !url.trim().is_empty())
        {
            targets.push(ChannelTarget { channel: Channel::UserWebhook, url: Some(url) });
        }
        if let Some(url) = &self.global_webhook_url {
            targets.push(ChannelTarget { channel: Channel::GlobalWebhook, url: Some(url.clone()) });
        }
        if self.broker.is_enabled() {
            targets.push(ChannelTarget { channel: Channel::Broker, url: None });
        }

        targets.retain(|target| !skip.contains(&target.channel));
        targets
    }

    /// Delivers `event` to one target before `deadline`.
    ///
    /// Never fails: transport errors, deadline expiry and cancellation are
    /// reported as a failed result.
    pub async fn deliver(
        &self,
        event: Arc<DeliveryEvent>,
        target: ChannelTarget,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> DeliveryResult {
        let channel = target.channel;
        let started_at = self.clock.now_utc();
        let start = self.clock.now();

        let outcome = tokio::select! {
            outcome = self.deliver_inner(&event, target, deadline) => outcome,
            () = cancel.cancelled() => Err(DeliveryError::context_expired(channel)),
        };
        let duration = self.clock.now().saturating_duration_since(start);

        match outcome {
            Ok(()) => {
                debug!(
                    event_id = %event.id,
                    channel = %channel,
                    duration_ms = duration.as_millis() as u64,
                    "channel delivery succeeded"
                );
                DeliveryResult::succeeded(channel, started_at, duration)
            },
            Err(error) => {
                debug!(
                    event_id = %event.id,
                    channel = %channel,
                    duration_ms = duration.as_millis() as u64,
                    error = %error,
                    category = %ErrorCategory::from(&error),
                    "channel delivery failed"
                );
                DeliveryResult::failed(channel, started_at, duration, error.to_string())
            },
        }
    }

    async fn deliver_inner(
        &self,
        event: &DeliveryEvent,
        target: ChannelTarget,
        deadline: Instant,
    ) -> Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DeliveryError::context_expired(target.channel));
        }

        match (target.channel, target.url) {
            (Channel::Broker, _) => self.publish_to_broker(event, deadline).await,
            (channel, Some(url)) => {
                let request = self.webhook_request(event, channel, url, remaining);
                self.client.post(request).await.map(|_| ())
            },
            (channel, None) => Err(DeliveryError::configuration(format!(
                "{channel} target planned without a destination url"
            ))),
        }
    }

    fn webhook_request(
        &self,
        event: &DeliveryEvent,
        channel: Channel,
        url: String,
        remaining: Duration,
    ) -> WebhookRequest {
        let instance_name = self.destinations.instance_name(&event.auth_token).unwrap_or_default();

        let mut request = WebhookRequest::new(url)
            .field("jsonData", event.body_text())
            .field("token", event.auth_token.clone());
        if channel == Channel::GlobalWebhook {
            request = request.field("userID", event.tenant_id.to_string());
        }
        request = request.field("instanceName", instance_name);

        request.attachment = event.attached_file.clone();
        request.timeout = Some(self.call_timeout.min(remaining));
        request.event_id = event.id.to_string();
        request.channel = channel.as_str();
        request
    }

    async fn publish_to_broker(&self, event: &DeliveryEvent, deadline: Instant) -> Result<()> {
        let message = BrokerMessage {
            body: event.body.clone(),
            event_type: event.event_type.clone(),
            tenant_id: event.tenant_id.to_string(),
            token: event.auth_token.clone(),
            instance_name: self.destinations.instance_name(&event.auth_token).unwrap_or_default(),
        };

        tokio::time::timeout_at(deadline, self.broker.publish(message))
            .await
            .map_err(|_elapsed| DeliveryError::context_expired(Channel::Broker))?
    }
}
