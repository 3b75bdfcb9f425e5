//! Delivery manager lifecycle tests.
//!
//! Webhook destinations are wiremock servers and the broker is the in-crate
//! mock. Retry cycles are driven by advancing a `TestClock` and calling
//! `sweep()` directly, except where the scheduler itself is under test.

use std::{collections::HashSet, sync::Arc, time::Duration};

use herald_core::{Channel, Clock, DeliveryEvent, DeliveryStatus, EventId, RealClock, TestClock};
use herald_delivery::{
    destinations::mock::{MockBroker, MockDestinations},
    DeliveryError, DeliveryManager, ManagerConfig, NoopJournal, RedeliveryMode, RetryPolicy,
    RetryTrigger,
};
use serde_json::json;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "tok-1";

struct Harness {
    manager: DeliveryManager,
    broker: MockBroker,
    destinations: MockDestinations,
    clock: TestClock,
}

impl Harness {
    async fn new(config: ManagerConfig) -> Self {
        let broker = MockBroker::new();
        let destinations = MockDestinations::new();
        let clock = TestClock::new();
        let manager = DeliveryManager::new(
            config,
            Arc::new(destinations.clone()),
            Arc::new(broker.clone()),
            Arc::new(clock.clone()),
            Arc::new(NoopJournal),
        )
        .await
        .expect("manager builds");

        Self { manager, broker, destinations, clock }
    }

    async fn retry_cycle(&self) -> usize {
        self.clock.advance(Duration::from_secs(3));
        self.manager.sweep().await
    }
}

fn event(tenant: &str) -> DeliveryEvent {
    DeliveryEvent::new(tenant, TOKEN, "Message", json!({"text": "hello"})).unwrap()
}

async fn webhook_responding(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map(|requests| requests.len()).unwrap_or_default()
}

async fn wait_for_attempts(manager: &DeliveryManager, id: &EventId, attempts: u32) -> DeliveryEvent {
    for _ in 0..300 {
        if let Some(event) = manager.get_status(id).await {
            if event.attempt_count == attempts && event.last_attempt_at.is_some() {
                return event;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("event {id} never reached attempt {attempts}");
}

async fn wait_until_resolved(manager: &DeliveryManager, id: &EventId) {
    for _ in 0..300 {
        if manager.get_status(id).await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("event {id} never left pending tracking");
}

#[tokio::test]
async fn no_enabled_channel_delivers_on_first_cycle() {
    let harness = Harness::new(ManagerConfig::default()).await;
    harness.broker.set_enabled(false);

    let id = harness.manager.submit(event("tenant-1")).await;
    wait_until_resolved(&harness.manager, &id).await;

    let stats = harness.manager.stats().await;
    assert_eq!(stats.events_delivered, 1);
    assert_eq!(stats.cycles_completed, 1);
    assert_eq!(harness.manager.count_pending().await, 0);
}

#[tokio::test]
async fn submit_assigns_tenant_scoped_id() {
    let harness = Harness::new(ManagerConfig::default()).await;
    harness.broker.set_failing(true);

    let id = harness.manager.submit(event("tenant-1")).await;

    assert_eq!(id.as_str(), format!("tenant-1_{}", harness.clock.unix_nanos()));
    let stored = harness.manager.get_status(&id).await.expect("pending");
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.created_at, harness.clock.now_utc());
}

#[tokio::test]
async fn one_failing_channel_fails_event_after_max_retries() {
    let webhook = webhook_responding(200).await;
    let harness = Harness::new(ManagerConfig::default()).await;
    harness.destinations.set_webhook(TOKEN, webhook.uri());
    harness.broker.set_failing(true);

    let id = harness.manager.submit(event("tenant-1")).await;

    let first = wait_for_attempts(&harness.manager, &id, 1).await;
    assert_eq!(first.status, DeliveryStatus::Pending);
    assert!(first.last_error.as_deref().unwrap().contains("broker"));

    assert_eq!(harness.retry_cycle().await, 1);
    wait_for_attempts(&harness.manager, &id, 2).await;

    assert_eq!(harness.retry_cycle().await, 1);
    wait_until_resolved(&harness.manager, &id).await;

    let failed = harness.manager.list_failed(10).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].status, DeliveryStatus::Failed);
    assert_eq!(failed[0].attempt_count, 3);
    assert_eq!(failed[0].last_error.as_deref(), Some("broker publish failed: broker unavailable"));
    assert!(failed[0].delivered_channels.contains(&Channel::UserWebhook));

    assert_eq!(request_count(&webhook).await, 3);
    assert_eq!(harness.broker.attempt_count(), 3);
    assert_eq!(harness.retry_cycle().await, 0);
}

#[tokio::test]
async fn attempt_count_grows_by_one_per_cycle() {
    let harness = Harness::new(ManagerConfig {
        retry_policy: RetryPolicy { max_retries: 5, ..RetryPolicy::default() },
        ..ManagerConfig::default()
    })
    .await;
    harness.broker.set_failing(true);

    let id = harness.manager.submit(event("tenant-1")).await;
    for expected in 1..5 {
        let event = wait_for_attempts(&harness.manager, &id, expected).await;
        assert!(event.attempt_count <= 5);
        assert_eq!(harness.retry_cycle().await, 1);
    }
    wait_until_resolved(&harness.manager, &id).await;

    assert_eq!(harness.broker.attempt_count(), 5);
    assert_eq!(harness.manager.list_failed(1).await[0].attempt_count, 5);
}

#[tokio::test]
async fn concurrent_submits_get_unique_ids() {
    let harness = Harness::new(ManagerConfig::default()).await;
    harness.broker.set_failing(true);

    let mut handles = Vec::new();
    for _ in 0..100 {
        let manager = harness.manager.clone();
        handles.push(tokio::spawn(async move { manager.submit(event("tenant-1")).await }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }

    assert_eq!(ids.len(), 100);
    assert_eq!(harness.manager.count_pending().await, 100);
}

#[tokio::test]
async fn force_retry_revives_failed_event_and_redispatches_all_channels() {
    let webhook = webhook_responding(200).await;
    let harness = Harness::new(ManagerConfig {
        retry_policy: RetryPolicy { max_retries: 2, ..RetryPolicy::default() },
        ..ManagerConfig::default()
    })
    .await;
    harness.destinations.set_webhook(TOKEN, webhook.uri());
    harness.broker.set_failing(true);

    let id = harness.manager.submit(event("tenant-1")).await;
    wait_for_attempts(&harness.manager, &id, 1).await;
    harness.retry_cycle().await;
    wait_until_resolved(&harness.manager, &id).await;
    assert!(harness.manager.get_status(&id).await.is_none());
    assert_eq!(request_count(&webhook).await, 2);

    let trigger = harness.manager.force_retry(Some(&id)).await.unwrap();
    assert_eq!(trigger, RetryTrigger::Dispatched { event_id: id.clone() });

    let revived = wait_for_attempts(&harness.manager, &id, 1).await;
    assert_eq!(revived.status, DeliveryStatus::Pending);
    assert!(revived.delivered_channels.contains(&Channel::UserWebhook));
    assert_eq!(request_count(&webhook).await, 3);
    assert_eq!(harness.broker.attempt_count(), 3);
    assert!(harness.manager.list_failed(10).await.is_empty());
}

#[tokio::test]
async fn force_retry_resets_pending_event() {
    let harness = Harness::new(ManagerConfig::default()).await;
    harness.broker.set_failing(true);

    let id = harness.manager.submit(event("tenant-1")).await;
    wait_for_attempts(&harness.manager, &id, 1).await;
    harness.retry_cycle().await;
    wait_for_attempts(&harness.manager, &id, 2).await;

    harness.broker.set_failing(false);
    let trigger = harness.manager.force_retry(Some(&id)).await.unwrap();
    assert_eq!(trigger, RetryTrigger::Dispatched { event_id: id.clone() });

    wait_until_resolved(&harness.manager, &id).await;
    assert_eq!(harness.broker.published().len(), 1);
}

#[tokio::test]
async fn force_retry_unknown_event_is_not_found() {
    let harness = Harness::new(ManagerConfig::default()).await;

    let result = harness.manager.force_retry(Some(&EventId::from("missing"))).await;

    assert!(matches!(result, Err(DeliveryError::EventNotFound { .. })));
}

#[tokio::test]
async fn force_retry_without_id_sweeps_pending_events() {
    let harness = Harness::new(ManagerConfig::default()).await;
    harness.broker.set_failing(true);

    let first = harness.manager.submit(event("tenant-1")).await;
    let second = harness.manager.submit(event("tenant-2")).await;
    wait_for_attempts(&harness.manager, &first, 1).await;
    wait_for_attempts(&harness.manager, &second, 1).await;
    harness.clock.advance(Duration::from_secs(3));

    let trigger = harness.manager.force_retry(None).await.unwrap();

    assert_eq!(trigger, RetryTrigger::Swept { dispatched: 2 });
}

#[tokio::test]
async fn sweep_skips_events_younger_than_interval() {
    let harness = Harness::new(ManagerConfig::default()).await;
    harness.broker.set_failing(true);

    let id = harness.manager.submit(event("tenant-1")).await;
    wait_for_attempts(&harness.manager, &id, 1).await;

    harness.clock.advance(Duration::from_secs(1));
    assert_eq!(harness.manager.sweep().await, 0);
}

#[tokio::test]
async fn unset_global_webhook_and_failing_user_webhook_fail_event() {
    let webhook = webhook_responding(500).await;
    let harness = Harness::new(ManagerConfig::default()).await;
    harness.destinations.set_webhook(TOKEN, webhook.uri());
    harness.broker.set_enabled(false);

    let id = harness.manager.submit(event("tenant-1")).await;
    assert_eq!(harness.manager.count_pending().await, 1);

    wait_for_attempts(&harness.manager, &id, 1).await;
    harness.retry_cycle().await;
    wait_for_attempts(&harness.manager, &id, 2).await;
    harness.retry_cycle().await;
    wait_until_resolved(&harness.manager, &id).await;

    assert_eq!(harness.manager.count_pending().await, 0);
    assert_eq!(request_count(&webhook).await, 3);
    let failed = harness.manager.list_failed(10).await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].last_error.as_deref(), Some("server error: HTTP 500"));
}

#[tokio::test]
async fn failed_channels_only_mode_skips_delivered_channels() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(ManagerConfig {
        redelivery_mode: RedeliveryMode::FailedChannelsOnly,
        ..ManagerConfig::default()
    })
    .await;
    harness.destinations.set_webhook(TOKEN, server.uri());
    harness.broker.set_failing(true);

    let id = harness.manager.submit(event("tenant-1")).await;
    wait_for_attempts(&harness.manager, &id, 1).await;

    harness.broker.set_failing(false);
    harness.retry_cycle().await;
    wait_until_resolved(&harness.manager, &id).await;

    assert_eq!(harness.broker.published().len(), 1);
}

#[tokio::test]
async fn list_pending_filters_by_tenant_and_limits() {
    let harness = Harness::new(ManagerConfig::default()).await;
    harness.broker.set_failing(true);

    for n in 0..3 {
        harness.manager.submit(event("tenant-a").with_id(format!("a-{n}"))).await;
        harness.clock.advance(Duration::from_millis(1));
    }
    harness.manager.submit(event("tenant-b").with_id("b-0")).await;

    let listing = harness.manager.list_pending(Some("tenant-a"), 2).await;
    assert_eq!(listing.total_pending, 4);
    assert_eq!(listing.filtered_count, 3);
    let ids: Vec<_> = listing.events.iter().map(|e| e.id.as_str().to_string()).collect();
    assert_eq!(ids, vec!["a-0", "a-1"]);

    let all = harness.manager.list_pending(None, 50).await;
    assert_eq!(all.events.len(), 4);
}

#[tokio::test]
async fn slow_channel_fails_at_cycle_deadline() {
    let harness = Harness::new(ManagerConfig {
        delivery_timeout: Duration::from_millis(100),
        ..ManagerConfig::default()
    })
    .await;
    harness.broker.set_delay(Some(Duration::from_secs(5)));

    let id = harness.manager.submit(event("tenant-1")).await;
    let event = wait_for_attempts(&harness.manager, &id, 1).await;

    assert!(event.last_error.unwrap().contains("context deadline exceeded"));
    assert!(harness.broker.published().is_empty());
}

#[tokio::test]
async fn scheduler_redelivers_after_broker_recovers() {
    let webhook = webhook_responding(200).await;
    let broker = MockBroker::new();
    broker.set_failing(true);
    let destinations = MockDestinations::new();
    destinations.set_webhook(TOKEN, webhook.uri());

    let manager = DeliveryManager::new(
        ManagerConfig {
            retry_policy: RetryPolicy {
                max_retries: 10,
                interval: Duration::from_millis(200),
                ..RetryPolicy::default()
            },
            ..ManagerConfig::default()
        },
        Arc::new(destinations),
        Arc::new(broker.clone()),
        Arc::new(RealClock::new()),
        Arc::new(NoopJournal),
    )
    .await
    .unwrap();
    manager.start().await;

    let id = manager.submit(event("tenant-1")).await;
    let first = wait_for_attempts(&manager, &id, 1).await;
    assert_eq!(first.status, DeliveryStatus::Pending);

    broker.set_failing(false);
    wait_until_resolved(&manager, &id).await;

    assert_eq!(broker.published().len(), 1);
    assert!(request_count(&webhook).await >= 2);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_scheduler_and_new_cycles() {
    let broker = MockBroker::new();
    let manager = DeliveryManager::new(
        ManagerConfig {
            retry_policy: RetryPolicy {
                interval: Duration::from_millis(20),
                ..RetryPolicy::default()
            },
            shutdown_timeout: Duration::from_secs(1),
            ..ManagerConfig::default()
        },
        Arc::new(MockDestinations::new()),
        Arc::new(broker.clone()),
        Arc::new(RealClock::new()),
        Arc::new(NoopJournal),
    )
    .await
    .unwrap();
    manager.start().await;

    manager.shutdown().await.expect("clean shutdown");

    let id = manager.submit(event("tenant-1")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stored = manager.get_status(&id).await.expect("still pending");
    assert_eq!(stored.attempt_count, 0);
    assert_eq!(broker.attempt_count(), 0);
}
