//! Destination resolution and broker publication seams.
//!
//! The manager never stores tenant configuration or broker connections
//! itself. It asks a [`DestinationResolver`] where a tenant's webhook lives
//! and hands broker messages to a [`BrokerPublisher`]. Production wiring uses
//! [`StaticDestinations`] loaded from configuration and either a real
//! publisher or [`DisabledBroker`]; tests use the doubles in [`mock`].

use std::{collections::HashMap, future::Future, pin::Pin};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Resolves tenant-specific destinations from an auth token.
pub trait DestinationResolver: Send + Sync + 'static {
    /// Webhook URL for the tenant owning `token`.
    ///
    /// `None` or an empty string disables the user webhook channel.
    fn webhook_url(&self, token: &str) -> Option<String>;

    /// Human-readable instance name, best-effort.
    fn instance_name(&self, token: &str) -> Option<String>;
}

/// Message handed to the broker for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Serialized event body.
    pub body: Bytes,
    /// Domain event name.
    pub event_type: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Tenant auth token.
    pub token: String,
    /// Instance name, empty when unknown.
    pub instance_name: String,
}

/// Publishes events to a message broker.
///
/// Implementations own their connection management. The channel adapter
/// bounds every publish by the attempt deadline.
pub trait BrokerPublisher: Send + Sync + 'static {
    /// Returns true when the broker channel should be dispatched.
    fn is_enabled(&self) -> bool;

    /// Publishes one message.
    fn publish(&self, message: BrokerMessage) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Destination settings for one tenant token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDestination {
    /// Tenant the token belongs to.
    #[serde(default)]
    pub tenant_id: String,
    /// Tenant webhook URL, empty when unset.
    #[serde(default)]
    pub webhook_url: String,
    /// Display name of the tenant instance.
    #[serde(default)]
    pub instance_name: String,
}

/// Token-keyed destination table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDestinations {
    tenants: HashMap<String, TenantDestination>,
}

impl StaticDestinations {
    /// Creates a resolver over the given token table.
    pub fn new(tenants: HashMap<String, TenantDestination>) -> Self {
        Self { tenants }
    }

    /// Number of configured tokens.
    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    /// Returns true when no token is configured.
    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}

impl DestinationResolver for StaticDestinations {
    fn webhook_url(&self, token: &str) -> Option<String> {
        self.tenants
            .get(token)
            .map(|tenant| tenant.webhook_url.trim().to_string())
            .filter(|url| !url.is_empty())
    }

    fn instance_name(&self, token: &str) -> Option<String> {
        self.tenants
            .get(token)
            .map(|tenant| tenant.instance_name.clone())
            .filter(|name| !name.is_empty())
    }
}

/// Publisher for deployments without a broker.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledBroker;

impl BrokerPublisher for DisabledBroker {
    fn is_enabled(&self) -> bool {
        false
    }

    fn publish(&self, _message: BrokerMessage) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

pub mod mock {
    //! Controllable destination doubles for testing.
    //!
    //! `MockDestinations` holds a mutable token table and `MockBroker` can be
    //! switched between failing and healthy, delayed, and inspected for the
    //! messages it accepted.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, PoisonError, RwLock,
        },
        time::Duration,
    };

    use super::{BrokerMessage, BrokerPublisher, DestinationResolver};
    use crate::error::{DeliveryError, Result};

    /// In-memory resolver with mutable webhook and instance tables.
    #[derive(Debug, Clone, Default)]
    pub struct MockDestinations {
        webhooks: Arc<RwLock<HashMap<String, String>>>,
        instance_names: Arc<RwLock<HashMap<String, String>>>,
    }

    impl MockDestinations {
        /// Creates a resolver with no destinations.
        pub fn new() -> Self {
            Self::default()
        }

        /// Routes `token` to `url`.
        pub fn set_webhook(&self, token: impl Into<String>, url: impl Into<String>) {
            self.webhooks
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(token.into(), url.into());
        }

        /// Removes the webhook for `token`.
        pub fn clear_webhook(&self, token: &str) {
            self.webhooks.write().unwrap_or_else(PoisonError::into_inner).remove(token);
        }

        /// Names the instance behind `token`.
        pub fn set_instance_name(&self, token: impl Into<String>, name: impl Into<String>) {
            self.instance_names
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(token.into(), name.into());
        }
    }

    impl DestinationResolver for MockDestinations {
        fn webhook_url(&self, token: &str) -> Option<String> {
            self.webhooks.read().unwrap_or_else(PoisonError::into_inner).get(token).cloned()
        }

        fn instance_name(&self, token: &str) -> Option<String> {
            self.instance_names.read().unwrap_or_else(PoisonError::into_inner).get(token).cloned()
        }
    }

    /// Broker double recording accepted messages.
    #[derive(Debug, Clone)]
    pub struct MockBroker {
        enabled: Arc<AtomicBool>,
        failing: Arc<AtomicBool>,
        delay: Arc<RwLock<Option<Duration>>>,
        attempts: Arc<AtomicUsize>,
        published: Arc<RwLock<Vec<BrokerMessage>>>,
    }

    impl MockBroker {
        /// Creates an enabled, healthy broker.
        pub fn new() -> Self {
            Self {
                enabled: Arc::new(AtomicBool::new(true)),
                failing: Arc::new(AtomicBool::new(false)),
                delay: Arc::new(RwLock::new(None)),
                attempts: Arc::new(AtomicUsize::new(0)),
                published: Arc::new(RwLock::new(Vec::new())),
            }
        }

        /// Creates a broker that reports itself disabled.
        pub fn disabled() -> Self {
            let broker = Self::new();
            broker.set_enabled(false);
            broker
        }

        /// Enables or disables the broker channel.
        pub fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }

        /// Makes subsequent publishes fail or succeed.
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Delays every publish by `delay`.
        pub fn set_delay(&self, delay: Option<Duration>) {
            *self.delay.write().unwrap_or_else(PoisonError::into_inner) = delay;
        }

        /// Number of publish calls, successful or not.
        pub fn attempt_count(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Messages accepted so far.
        pub fn published(&self) -> Vec<BrokerMessage> {
            self.published.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    impl Default for MockBroker {
        fn default() -> Self {
            Self::new()
        }
    }

    impl BrokerPublisher for MockBroker {
        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn publish(
            &self,
            message: BrokerMessage,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);

                let delay = *self.delay.read().unwrap_or_else(PoisonError::into_inner);
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }

                if self.failing.load(Ordering::SeqCst) {
                    return Err(DeliveryError::broker("broker unavailable"));
                }

                self.published.write().unwrap_or_else(PoisonError::into_inner).push(message);
                Ok(())
            })
        }
    }
}
