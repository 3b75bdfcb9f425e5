//! Delivery manager owning the event lifecycle.
//!
//! The manager accepts events from producers, fans each one out to its
//! enabled channels, aggregates the channel results and decides whether the
//! event is delivered, failed or left pending for the retry scheduler.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ submit ┌─────────────────┐ try_spawn ┌──────────────┐
//! │ Producer │───────▶│ DeliveryManager │──────────▶│ DispatchPool │
//! └──────────┘        └─────────────────┘           └──────────────┘
//!                        ▲        │ pending map           │ one cycle
//!                 sweep  │        ▼                       ▼
//!              ┌────────────────┐   ┌────────────────────────────────┐
//!              │ RetryScheduler │   │ JoinSet: webhook │ global │ mq │
//!              └────────────────┘   └────────────────────────────────┘
//! ```
//!
//! Every pending event lives in one map guarded by a single `RwLock`. A cycle
//! marks its event in flight before it starts and applies its outcome with
//! one write-lock acquisition, so at most one cycle runs per event and
//! `attempt_count` grows by exactly one per cycle.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use herald_core::{Channel, Clock, DeliveryEvent, DeliveryResult, DeliveryStatus, EventId};
use serde::Serialize;
use tokio::{
    sync::{Mutex, RwLock},
    task::{JoinHandle, JoinSet},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    aggregate::CycleOutcome,
    channels::{ChannelDispatcher, ChannelTarget, DEFAULT_CALL_TIMEOUT},
    client::{ClientConfig, WebhookClient},
    destinations::{BrokerPublisher, DestinationResolver},
    error::{DeliveryError, Result},
    journal::{DeliveryJournal, JournalEntry},
    retry::{RedeliveryMode, RetryPolicy},
    scheduler::RetryScheduler,
    worker_pool::{Dispatch, DispatchPool, DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_QUEUED},
};

/// Default deadline shared by all channels of one cycle.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the failed-event archive.
pub const DEFAULT_FAILED_ARCHIVE_CAPACITY: usize = 1000;

/// Configuration for the delivery manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Retry limits and backoff strategy.
    pub retry_policy: RetryPolicy,

    /// Deadline shared by all channels of one cycle.
    pub delivery_timeout: Duration,

    /// Timeout of a single webhook call, clamped to the cycle deadline.
    pub call_timeout: Duration,

    /// Global webhook receiving every tenant's events.
    pub global_webhook_url: Option<String>,

    /// Which channels retry cycles re-dispatch.
    pub redelivery_mode: RedeliveryMode,

    /// Concurrently running cycles.
    pub max_in_flight: usize,

    /// Cycles waiting for a slot before further ones are deferred.
    pub max_queued: usize,

    /// Failed events kept for inspection and revival.
    pub failed_archive_capacity: usize,

    /// Maximum time to wait for background work on shutdown.
    pub shutdown_timeout: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            global_webhook_url: None,
            redelivery_mode: RedeliveryMode::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_queued: DEFAULT_MAX_QUEUED,
            failed_archive_capacity: DEFAULT_FAILED_ARCHIVE_CAPACITY,
            shutdown_timeout: Duration::from_secs(30),
            client_config: ClientConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Checks limits that would make the manager unusable.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` naming the first invalid
    /// setting.
    pub fn validate(&self) -> Result<()> {
        if self.retry_policy.max_retries == 0 {
            return Err(DeliveryError::configuration("max_retries must be at least 1"));
        }
        if self.retry_policy.interval.is_zero() {
            return Err(DeliveryError::configuration("retry interval must be positive"));
        }
        if self.delivery_timeout.is_zero() || self.call_timeout.is_zero() {
            return Err(DeliveryError::configuration("delivery timeouts must be positive"));
        }
        if self.max_in_flight == 0 {
            return Err(DeliveryError::configuration("max_in_flight must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter_factor) {
            return Err(DeliveryError::configuration("jitter_factor must be within 0.0..=1.0"));
        }
        Ok(())
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    /// Events accepted by `submit`.
    pub events_submitted: u64,
    /// Events that reached `Delivered`.
    pub events_delivered: u64,
    /// Events that reached `Failed`.
    pub events_failed: u64,
    /// Completed fan-out cycles.
    pub cycles_completed: u64,
    /// Cycles deferred because the dispatch pool was full.
    pub cycles_deferred: u64,
    /// Successful channel deliveries.
    pub channel_successes: u64,
    /// Failed channel deliveries.
    pub channel_failures: u64,
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    /// Events awaiting delivery.
    pub pending_events: usize,
    /// Cycles currently running.
    pub in_flight: usize,
    /// Cycles waiting for a slot.
    pub queued: usize,
    /// Events in the failed archive.
    pub failed_archived: usize,
    /// Cycles allowed per event.
    pub max_retries: u32,
    /// Cycle deadline in milliseconds.
    pub timeout_ms: u64,
    /// Retry sweep interval in milliseconds.
    pub retry_interval_ms: u64,
    /// Backoff strategy name.
    pub backoff: String,
    /// Redelivery mode name.
    pub redelivery_mode: String,
    /// Lifetime counters.
    pub stats: ManagerStats,
}

/// Pending events matching a listing request.
#[derive(Debug, Clone, Serialize)]
pub struct PendingListing {
    /// All pending events.
    pub total_pending: usize,
    /// Pending events matching the tenant filter.
    pub filtered_count: usize,
    /// Up to `limit` matching events, oldest first.
    pub events: Vec<DeliveryEvent>,
}

/// Result of a forced retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryTrigger {
    /// A fresh cycle was started for the event.
    Dispatched {
        /// Retried event
        event_id: EventId,
    },
    /// The event was reset while a cycle was running; that cycle's outcome
    /// applies to the reset record.
    AlreadyInFlight {
        /// Retried event
        event_id: EventId,
    },
    /// The event was reset but the dispatch pool was full; a sweep picks it up.
    Deferred {
        /// Retried event
        event_id: EventId,
    },
    /// A sweep over all pending events ran.
    Swept {
        /// Cycles started by the sweep
        dispatched: usize,
    },
}

#[derive(Debug)]
struct PendingEntry {
    event: DeliveryEvent,
    in_flight: bool,
}

impl PendingEntry {
    fn new(event: DeliveryEvent) -> Self {
        Self { event, in_flight: false }
    }
}

enum Resolution {
    Delivered(DeliveryEvent),
    Failed(DeliveryEvent),
    Retrying(DeliveryEvent),
}

impl Resolution {
    fn journal_entry(&self) -> JournalEntry {
        match self {
            Self::Delivered(event) => JournalEntry::Resolved {
                event_id: event.id.clone(),
                status: DeliveryStatus::Delivered,
            },
            Self::Failed(event) => {
                JournalEntry::Resolved { event_id: event.id.clone(), status: DeliveryStatus::Failed }
            },
            Self::Retrying(event) => JournalEntry::Upsert { event: event.clone() },
        }
    }
}

struct ManagerCore {
    config: ManagerConfig,
    pending: RwLock<HashMap<EventId, PendingEntry>>,
    failed: RwLock<VecDeque<DeliveryEvent>>,
    dispatcher: ChannelDispatcher,
    clock: Arc<dyn Clock>,
    journal: Arc<dyn DeliveryJournal>,
    pool: DispatchPool,
    stats: RwLock<ManagerStats>,
    cancellation_token: CancellationToken,
    last_id_nanos: AtomicI64,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the delivery manager.
///
/// Cloning is cheap; every clone drives the same pending map.
#[derive(Clone)]
pub struct DeliveryManager {
    inner: Arc<ManagerCore>,
}

impl std::fmt::Debug for DeliveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryManager").field("config", &self.inner.config).finish_non_exhaustive()
    }
}

impl DeliveryManager {
    /// Creates a manager and restores unresolved events from `journal`.
    ///
    /// The retry scheduler is not running until [`DeliveryManager::start`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` for invalid settings or an HTTP client
    /// that cannot be built, and `JournalError` if replay fails.
    pub async fn new(
        config: ManagerConfig,
        destinations: Arc<dyn DestinationResolver>,
        broker: Arc<dyn BrokerPublisher>,
        clock: Arc<dyn Clock>,
        journal: Arc<dyn DeliveryJournal>,
    ) -> Result<Self> {
        config.validate()?;

        let client = WebhookClient::new(config.client_config.clone())?;
        let dispatcher = ChannelDispatcher::new(
            client,
            destinations,
            broker,
            config.global_webhook_url.clone(),
            config.call_timeout,
            clock.clone(),
        );

        let mut pending = HashMap::new();
        for mut event in journal.replay().await? {
            event.status = DeliveryStatus::Pending;
            pending.insert(event.id.clone(), PendingEntry::new(event));
        }
        if !pending.is_empty() {
            info!(pending_events = pending.len(), "restored pending events from journal");
        }

        let cancellation_token = CancellationToken::new();
        let pool =
            DispatchPool::new(config.max_in_flight, config.max_queued, cancellation_token.clone());

        Ok(Self {
            inner: Arc::new(ManagerCore {
                config,
                pending: RwLock::new(pending),
                failed: RwLock::new(VecDeque::new()),
                dispatcher,
                clock,
                journal,
                pool,
                stats: RwLock::new(ManagerStats::default()),
                cancellation_token,
                last_id_nanos: AtomicI64::new(0),
                scheduler: Mutex::new(None),
            }),
        })
    }

    /// Manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Starts the retry scheduler. Calling it again has no effect.
    pub async fn start(&self) {
        let mut scheduler = self.inner.scheduler.lock().await;
        if scheduler.is_some() {
            warn!("retry scheduler already running");
            return;
        }

        let policy = &self.inner.config.retry_policy;
        info!(
            max_retries = policy.max_retries,
            retry_interval_ms = policy.interval.as_millis() as u64,
            backoff = %policy.strategy,
            timeout_ms = self.inner.config.delivery_timeout.as_millis() as u64,
            "starting delivery manager"
        );

        let task = RetryScheduler::new(
            self.clone(),
            policy.interval,
            self.inner.clock.clone(),
            self.inner.cancellation_token.child_token(),
        );
        *scheduler = Some(tokio::spawn(task.run()));
    }

    /// Stops the scheduler and waits for in-flight cycles.
    ///
    /// Cycles interrupted by shutdown are not counted as attempts; their
    /// events stay pending (and journaled) for the next start.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if background work outlives
    /// the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down delivery manager");
        let timeout = self.inner.config.shutdown_timeout;
        let started = Instant::now();

        self.inner.cancellation_token.cancel();

        if let Some(handle) = self.inner.scheduler.lock().await.take() {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {},
                Ok(Err(join_error)) => {
                    error!(error = %join_error, "retry scheduler task failed");
                },
                Err(_elapsed) => {
                    return Err(DeliveryError::ShutdownTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    });
                },
            }
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        self.inner.pool.shutdown_graceful(remaining).await
    }

    /// Accepts an event for delivery and returns its id.
    ///
    /// Assigns an id when none is set, resets lifecycle fields and triggers
    /// the first fan-out cycle without waiting for it. A caller-supplied id
    /// that is already pending is ignored and the existing record kept.
    pub async fn submit(&self, mut event: DeliveryEvent) -> EventId {
        if event.id.is_empty() {
            event.id = EventId::generate(&event.tenant_id, self.next_id_nanos());
        }
        event.status = DeliveryStatus::Pending;
        event.created_at = self.inner.clock.now_utc();
        event.attempt_count = 0;
        event.last_error = None;
        event.last_attempt_at = None;
        event.next_attempt_at = None;
        event.delivered_channels.clear();

        let event_id = event.id.clone();
        {
            let mut pending = self.inner.pending.write().await;
            if pending.contains_key(&event_id) {
                warn!(event_id = %event_id, "event already pending, ignoring duplicate submission");
                return event_id;
            }
            pending.insert(event_id.clone(), PendingEntry::new(event.clone()));
            self.journal(JournalEntry::Upsert { event: event.clone() }).await;
        }

        self.inner.stats.write().await.events_submitted += 1;
        info!(
            event_id = %event_id,
            tenant_id = %event.tenant_id,
            event_type = %event.event_type,
            "event submitted for delivery"
        );

        self.dispatch(&event_id).await;
        event_id
    }

    /// Snapshot of a pending event, `None` once it is terminal.
    pub async fn get_status(&self, event_id: &EventId) -> Option<DeliveryEvent> {
        self.inner.pending.read().await.get(event_id).map(|entry| entry.event.clone())
    }

    /// Number of pending events.
    pub async fn count_pending(&self) -> usize {
        self.inner.pending.read().await.len()
    }

    /// Lists up to `limit` pending events, oldest first.
    pub async fn list_pending(&self, tenant_id: Option<&str>, limit: usize) -> PendingListing {
        let pending = self.inner.pending.read().await;
        let total_pending = pending.len();

        let mut events: Vec<DeliveryEvent> = pending
            .values()
            .filter(|entry| {
                tenant_id.map_or(true, |tenant| entry.event.tenant_id.as_str() == tenant)
            })
            .map(|entry| entry.event.clone())
            .collect();
        drop(pending);

        let filtered_count = events.len();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        events.truncate(limit);

        PendingListing { total_pending, filtered_count, events }
    }

    /// Most recently failed events, newest first.
    pub async fn list_failed(&self, limit: usize) -> Vec<DeliveryEvent> {
        self.inner.failed.read().await.iter().rev().take(limit).cloned().collect()
    }

    /// Forces a retry of one event, or a sweep over all pending events.
    ///
    /// With an id the event's attempt count is reset and every enabled
    /// channel is dispatched again. Failed events are revived from the
    /// archive.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::EventNotFound` for an id that is neither
    /// pending nor archived.
    pub async fn force_retry(&self, event_id: Option<&EventId>) -> Result<RetryTrigger> {
        let Some(event_id) = event_id else {
            let dispatched = self.sweep().await;
            info!(dispatched, "forced retry sweep completed");
            return Ok(RetryTrigger::Swept { dispatched });
        };

        let in_flight = {
            let mut pending = self.inner.pending.write().await;
            let (snapshot, in_flight) = match pending.get_mut(event_id) {
                Some(entry) => {
                    reset_for_retry(&mut entry.event);
                    (entry.event.clone(), entry.in_flight)
                },
                None => {
                    let mut failed = self.inner.failed.write().await;
                    let position = failed
                        .iter()
                        .rposition(|event| &event.id == event_id)
                        .ok_or_else(|| DeliveryError::event_not_found(event_id))?;
                    let mut event = failed
                        .remove(position)
                        .ok_or_else(|| DeliveryError::event_not_found(event_id))?;
                    reset_for_retry(&mut event);
                    pending.insert(event_id.clone(), PendingEntry::new(event.clone()));
                    (event, false)
                },
            };
            self.journal(JournalEntry::Upsert { event: snapshot }).await;
            in_flight
        };

        info!(event_id = %event_id, in_flight, "forced retry of event");

        if in_flight {
            return Ok(RetryTrigger::AlreadyInFlight { event_id: event_id.clone() });
        }

        match self.dispatch(event_id).await {
            DispatchState::Started => Ok(RetryTrigger::Dispatched { event_id: event_id.clone() }),
            DispatchState::InFlight => {
                Ok(RetryTrigger::AlreadyInFlight { event_id: event_id.clone() })
            },
            DispatchState::Deferred => Ok(RetryTrigger::Deferred { event_id: event_id.clone() }),
            DispatchState::Missing => Err(DeliveryError::event_not_found(event_id)),
        }
    }

    /// Dispatches every pending event the retry policy reports as due.
    ///
    /// Returns the number of cycles started.
    pub async fn sweep(&self) -> usize {
        let now = self.inner.clock.now_utc();
        let policy = &self.inner.config.retry_policy;

        let mut due: Vec<(chrono::DateTime<chrono::Utc>, EventId)> = {
            let pending = self.inner.pending.read().await;
            pending
                .values()
                .filter(|entry| {
                    !entry.in_flight
                        && entry.event.status == DeliveryStatus::Pending
                        && policy.is_due(&entry.event, now)
                })
                .map(|entry| (entry.event.created_at, entry.event.id.clone()))
                .collect()
        };
        if due.is_empty() {
            return 0;
        }
        due.sort();

        let mut dispatched = 0;
        for (_, event_id) in &due {
            if self.dispatch(event_id).await == DispatchState::Started {
                dispatched += 1;
            }
        }

        debug!(due = due.len(), dispatched, "retry sweep completed");
        dispatched
    }

    /// Overall manager status.
    pub async fn status(&self) -> ManagerStatus {
        let pending_events = self.count_pending().await;
        let failed_archived = self.inner.failed.read().await.len();
        let stats = self.inner.stats.read().await.clone();
        let config = &self.inner.config;

        ManagerStatus {
            pending_events,
            in_flight: self.inner.pool.in_flight(),
            queued: self.inner.pool.queued(),
            failed_archived,
            max_retries: config.retry_policy.max_retries,
            timeout_ms: config.delivery_timeout.as_millis() as u64,
            retry_interval_ms: config.retry_policy.interval.as_millis() as u64,
            backoff: config.retry_policy.strategy.to_string(),
            redelivery_mode: config.redelivery_mode.to_string(),
            stats,
        }
    }

    /// Lifetime counters.
    pub async fn stats(&self) -> ManagerStats {
        self.inner.stats.read().await.clone()
    }

    fn next_id_nanos(&self) -> i64 {
        let candidate = self.inner.clock.unix_nanos();
        let previous = self
            .inner
            .last_id_nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(candidate.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        candidate.max(previous.saturating_add(1))
    }

    async fn dispatch(&self, event_id: &EventId) -> DispatchState {
        let snapshot = {
            let mut pending = self.inner.pending.write().await;
            let Some(entry) = pending.get_mut(event_id) else {
                return DispatchState::Missing;
            };
            if entry.in_flight {
                return DispatchState::InFlight;
            }
            entry.in_flight = true;
            Arc::new(entry.event.clone())
        };

        let manager = self.clone();
        match self.inner.pool.try_spawn(async move { manager.run_cycle(snapshot).await }) {
            Dispatch::Accepted => DispatchState::Started,
            Dispatch::Deferred => {
                if let Some(entry) = self.inner.pending.write().await.get_mut(event_id) {
                    entry.in_flight = false;
                }
                self.inner.stats.write().await.cycles_deferred += 1;
                debug!(event_id = %event_id, "delivery cycle deferred");
                DispatchState::Deferred
            },
        }
    }

    async fn run_cycle(self, snapshot: Arc<DeliveryEvent>) {
        let span = info_span!(
            "delivery_cycle",
            event_id = %snapshot.id,
            tenant_id = %snapshot.tenant_id,
            attempt = snapshot.attempt_count + 1,
        );

        async move {
            let skip = match self.inner.config.redelivery_mode {
                RedeliveryMode::AllChannels => Default::default(),
                RedeliveryMode::FailedChannelsOnly => snapshot.delivered_channels.clone(),
            };
            let targets = self.inner.dispatcher.plan(&snapshot, &skip);
            let results = self.fan_out(snapshot.clone(), targets).await;

            if self.inner.cancellation_token.is_cancelled() {
                if let Some(entry) = self.inner.pending.write().await.get_mut(&snapshot.id) {
                    entry.in_flight = false;
                }
                debug!("delivery cycle interrupted by shutdown");
                return;
            }

            let outcome = CycleOutcome::from_results(&results);
            self.apply_outcome(&snapshot.id, outcome).await;
        }
        .instrument(span)
        .await;
    }

    async fn fan_out(
        &self,
        snapshot: Arc<DeliveryEvent>,
        targets: Vec<ChannelTarget>,
    ) -> Vec<DeliveryResult> {
        let planned: Vec<Channel> = targets.iter().map(|target| target.channel).collect();
        let deadline = Instant::now() + self.inner.config.delivery_timeout;
        let cancel = self.inner.cancellation_token.child_token();

        let mut tasks = JoinSet::new();
        let mut channels_by_task = HashMap::with_capacity(targets.len());
        for target in targets {
            let channel = target.channel;
            let core = self.inner.clone();
            let event = snapshot.clone();
            let cancel = cancel.clone();
            let handle = tasks.spawn(async move {
                core.dispatcher.deliver(event, target, deadline, cancel).await
            });
            channels_by_task.insert(handle.id(), channel);
        }

        let mut results = Vec::with_capacity(planned.len());
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next_with_id()).await {
                Ok(Some(Ok((_, result)))) => results.push(result),
                Ok(Some(Err(join_error))) => {
                    let Some(channel) = channels_by_task.get(&join_error.id()).copied() else {
                        continue;
                    };
                    let error = if join_error.is_panic() {
                        error!(channel = %channel, "channel delivery task panicked");
                        DeliveryError::worker_panic(channel)
                    } else {
                        DeliveryError::context_expired(channel)
                    };
                    results.push(self.failed_result(channel, error));
                },
                Ok(None) => break,
                Err(_elapsed) => {
                    cancel.cancel();
                    tasks.abort_all();
                    break;
                },
            }
        }

        let reported: HashSet<Channel> = results.iter().map(|result| result.channel).collect();
        for channel in planned.into_iter().filter(|channel| !reported.contains(channel)) {
            debug!(channel = %channel, "channel missed the delivery deadline");
            results.push(self.failed_result(channel, DeliveryError::context_expired(channel)));
        }

        results
    }

    fn failed_result(&self, channel: Channel, error: DeliveryError) -> DeliveryResult {
        DeliveryResult::failed(channel, self.inner.clock.now_utc(), Duration::ZERO, error.to_string())
    }

    async fn apply_outcome(&self, event_id: &EventId, outcome: CycleOutcome) {
        let now = self.inner.clock.now_utc();
        let policy = &self.inner.config.retry_policy;

        let resolution = {
            let mut pending = self.inner.pending.write().await;
            let Some(entry) = pending.get_mut(event_id) else {
                warn!(event_id = %event_id, "cycle finished for untracked event");
                return;
            };

            entry.in_flight = false;
            let event = &mut entry.event;
            event.attempt_count += 1;
            event.last_attempt_at = Some(now);
            event.delivered_channels.extend(outcome.succeeded_channels.iter().copied());

            let resolution = if outcome.success {
                event.status = DeliveryStatus::Delivered;
                event.next_attempt_at = None;
                pending.remove(event_id).map(|entry| Resolution::Delivered(entry.event))
            } else {
                event.last_error = outcome.last_error.clone();
                if policy.can_retry(event.attempt_count) {
                    event.next_attempt_at = policy.next_attempt_at(event.attempt_count, now);
                    Some(Resolution::Retrying(event.clone()))
                } else {
                    event.status = DeliveryStatus::Failed;
                    event.next_attempt_at = None;
                    let failed = pending.remove(event_id).map(|entry| entry.event);
                    if let Some(event) = &failed {
                        self.archive(event.clone()).await;
                    }
                    failed.map(Resolution::Failed)
                }
            };

            // Journaled under the pending lock so entries land in state order.
            if let Some(entry) = resolution.as_ref().map(Resolution::journal_entry) {
                self.journal(entry).await;
            }
            resolution
        };

        {
            let mut stats = self.inner.stats.write().await;
            stats.cycles_completed += 1;
            stats.channel_successes += outcome.success_count() as u64;
            stats.channel_failures += outcome.failure_count() as u64;
            match &resolution {
                Some(Resolution::Delivered(_)) => stats.events_delivered += 1,
                Some(Resolution::Failed(_)) => stats.events_failed += 1,
                _ => {},
            }
        }

        match resolution {
            Some(Resolution::Delivered(event)) => {
                info!(
                    event_id = %event.id,
                    attempt_count = event.attempt_count,
                    channels = outcome.dispatched,
                    "event delivered"
                );
            },
            Some(Resolution::Failed(event)) => {
                let exhausted = DeliveryError::retries_exhausted(event.attempt_count);
                error!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    attempt_count = event.attempt_count,
                    error = event.last_error.as_deref().unwrap_or_default(),
                    "{exhausted}"
                );
            },
            Some(Resolution::Retrying(event)) => {
                warn!(
                    event_id = %event.id,
                    attempt_count = event.attempt_count,
                    succeeded = outcome.success_count(),
                    failed = outcome.failure_count(),
                    error = event.last_error.as_deref().unwrap_or_default(),
                    "partial delivery failure, event will be retried"
                );
            },
            None => {},
        }
    }

    async fn archive(&self, event: DeliveryEvent) {
        let capacity = self.inner.config.failed_archive_capacity;
        if capacity == 0 {
            return;
        }
        let mut failed = self.inner.failed.write().await;
        failed.push_back(event);
        while failed.len() > capacity {
            failed.pop_front();
        }
    }

    async fn journal(&self, entry: JournalEntry) {
        if let Err(error) = self.inner.journal.record(entry).await {
            error!(error = %error, "failed to write delivery journal entry");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchState {
    Started,
    InFlight,
    Deferred,
    Missing,
}

fn reset_for_retry(event: &mut DeliveryEvent) {
    event.attempt_count = 0;
    event.status = DeliveryStatus::Pending;
    event.delivered_channels.clear();
    event.next_attempt_at = None;
}
