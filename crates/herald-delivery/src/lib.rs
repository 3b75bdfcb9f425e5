//! Concurrent multi-channel event delivery with bounded retries.
//!
//! This crate implements the delivery manager of the herald gateway. Each
//! submitted event is fanned out to a tenant webhook, a global webhook and a
//! message broker in parallel. Partial failures stay pending and are retried
//! by a periodic sweep until every channel accepts the event or the attempt
//! limit is reached.
//!
//! # Architecture
//!
//! 1. **Submit** - Producer hands an event to [`DeliveryManager::submit`]
//! 2. **Plan** - Channels without a destination are skipped
//! 3. **Fan-out** - One task per channel, all bounded by one deadline
//! 4. **Aggregate** - Event is delivered only if every channel succeeded
//! 5. **Retry** - [`scheduler::RetryScheduler`] re-dispatches due events
//!
//! Delivery is at-least-once: a retry cycle re-sends to channels that
//! already succeeded unless [`RedeliveryMode::FailedChannelsOnly`] is set.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use herald_core::{DeliveryEvent, RealClock};
//! use herald_delivery::{
//!     DeliveryManager, DisabledBroker, ManagerConfig, NoopJournal, StaticDestinations,
//! };
//!
//! # async fn example() -> herald_delivery::Result<()> {
//! let manager = DeliveryManager::new(
//!     ManagerConfig::default(),
//!     Arc::new(StaticDestinations::default()),
//!     Arc::new(DisabledBroker),
//!     Arc::new(RealClock::new()),
//!     Arc::new(NoopJournal),
//! )
//! .await?;
//! manager.start().await;
//!
//! let event = DeliveryEvent::new("tenant-1", "token", "Message", serde_json::json!({}))
//!     .expect("valid event");
//! let event_id = manager.submit(event).await;
//! println!("submitted {event_id}");
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod channels;
pub mod client;
pub mod destinations;
pub mod error;
pub mod journal;
pub mod manager;
pub mod retry;
pub mod scheduler;
pub mod worker_pool;

pub use aggregate::CycleOutcome;
pub use destinations::{
    BrokerMessage, BrokerPublisher, DestinationResolver, DisabledBroker, StaticDestinations,
    TenantDestination,
};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use journal::{DeliveryJournal, FileJournal, JournalEntry, NoopJournal};
pub use manager::{
    DeliveryManager, ManagerConfig, ManagerStats, ManagerStatus, PendingListing, RetryTrigger,
};
pub use retry::{BackoffStrategy, RedeliveryMode, RetryPolicy};
