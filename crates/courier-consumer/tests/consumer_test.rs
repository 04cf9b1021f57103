//! Consumer behaviour end to end: log in, webhooks and dead letters out.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{TimeZone, Utc};
use courier_consumer::{
    ConsumerConfig, ConsumerError, ConsumerStats, EventConsumer, EventProcessor,
    InMemoryDeadLetterSink, InMemoryEventSource, LogMessage, Result, TopicPartition,
};
use courier_core::{AccountId, DeliveryStatus, Event, RealClock};
use courier_delivery::{
    storage::mock::{MockWebhookStore, StoreOperation},
    ClientConfig, DeliveryClient, DeliveryConfig, Dispatcher,
};
use courier_testing::{EventBuilder, MockResponse, MockServer, TestClock, WebhookBuilder};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

const WAIT: Duration = Duration::from_secs(5);

fn tp() -> TopicPartition {
    TopicPartition::new("events", 0)
}

fn message(offset: i64, value: &Value) -> LogMessage {
    let bytes = serde_json::to_vec(value).unwrap();
    LogMessage::new("events", 0, offset, bytes).with_key("account-key")
}

fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        worker_count: 4,
        queue_capacity: 8,
        processing_retry_delay: Duration::from_millis(10),
        ..ConsumerConfig::default()
    }
}

async fn wait_for_stats<F>(consumer: &EventConsumer, predicate: F) -> ConsumerStats
where
    F: Fn(&ConsumerStats) -> bool,
{
    let poll = async {
        loop {
            let stats = consumer.stats().await;
            if predicate(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT, poll).await.unwrap()
}

struct DispatchContext {
    store: Arc<MockWebhookStore>,
    server: MockServer,
    source: InMemoryEventSource,
    sink: InMemoryDeadLetterSink,
    consumer: EventConsumer,
}

async fn dispatch_context() -> DispatchContext {
    let clock =
        Arc::new(TestClock::starting_at(Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()));
    let store = Arc::new(MockWebhookStore::with_clock(clock.clone()));
    let config = ClientConfig { timeout: Duration::from_secs(2), ..ClientConfig::default() };
    let client = Arc::new(DeliveryClient::with_clock(config, clock.clone()).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        client,
        clock.clone(),
        DeliveryConfig::default(),
    ));
    let server = MockServer::start().await;
    let source = InMemoryEventSource::new();
    let sink = InMemoryDeadLetterSink::new();

    let consumer = EventConsumer::new(
        Arc::new(source.clone()),
        Arc::new(sink.clone()),
        dispatcher,
        fast_config(),
        clock,
    );

    DispatchContext { store, server, source, sink, consumer }
}

#[tokio::test]
async fn delivers_event_and_commits_offset() {
    let mut ctx = dispatch_context().await;
    ctx.server.respond("/hook", MockResponse::ok()).await;

    let account_id = AccountId::new();
    let webhook =
        WebhookBuilder::new().account(account_id).url(ctx.server.endpoint("/hook")).build();
    ctx.store.add_webhook(webhook.clone()).await;

    let event = EventBuilder::new()
        .event_type("user.created")
        .account(account_id)
        .data(json!({"user_id": "usr_9"}));
    ctx.source.push(message(0, &event.message_value())).await;

    ctx.consumer.start().await.unwrap();
    assert!(ctx.source.wait_for_commit(&tp(), 1, WAIT).await);

    let deliveries = ctx.store.deliveries_for(webhook.id).await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Success);
    assert_eq!(deliveries[0].event_type, "user.created");

    let requests = ctx.server.requests_to("/hook").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].json().unwrap()["data"]["user_id"], "usr_9");

    let stats = ctx.consumer.stats().await;
    assert_eq!(stats.fetched, 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.dead_lettered, 0);
    assert!(ctx.sink.records().await.is_empty());

    ctx.consumer.shutdown_graceful(WAIT).await.unwrap();
}

#[tokio::test]
async fn malformed_account_is_dead_lettered_without_dispatch() {
    let mut ctx = dispatch_context().await;
    let value = json!({"type": "user.created", "account_id": "not-a-uuid", "data": {}});
    ctx.source.push(message(0, &value)).await;

    ctx.consumer.start().await.unwrap();
    assert!(ctx.source.wait_for_commit(&tp(), 1, WAIT).await);

    assert_eq!(ctx.store.call_count(StoreOperation::GetWebhooksByAccount).await, 0);
    ctx.server.assert_request_count(0).await;

    let records = ctx.sink.records().await;
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.original_topic, "events");
    assert_eq!(record.original_offset, 0);
    assert_eq!(record.key(), Some("account-key"));
    assert!(record.error.contains("invalid account_id"), "{}", record.error);
    assert_eq!(serde_json::from_str::<Value>(&record.original_value).unwrap(), value);

    ctx.consumer.shutdown_graceful(WAIT).await.unwrap();
}

#[tokio::test]
async fn transient_store_failure_is_retried_in_place() {
    let mut ctx = dispatch_context().await;
    ctx.server.respond("/hook", MockResponse::ok()).await;

    let account_id = AccountId::new();
    let webhook =
        WebhookBuilder::new().account(account_id).url(ctx.server.endpoint("/hook")).build();
    ctx.store.add_webhook(webhook.clone()).await;
    ctx.store.inject_error(StoreOperation::GetWebhooksByAccount, 1).await;

    let event = EventBuilder::new().account(account_id);
    ctx.source.push(message(0, &event.message_value())).await;

    ctx.consumer.start().await.unwrap();
    assert!(ctx.source.wait_for_commit(&tp(), 1, WAIT).await);

    assert_eq!(ctx.store.call_count(StoreOperation::GetWebhooksByAccount).await, 2);
    assert_eq!(ctx.store.deliveries_for(webhook.id).await.len(), 1);
    assert!(ctx.sink.records().await.is_empty());

    ctx.consumer.shutdown_graceful(WAIT).await.unwrap();
}

#[tokio::test]
async fn persistent_store_failure_is_dead_lettered_after_attempts() {
    let mut ctx = dispatch_context().await;
    let account_id = AccountId::new();
    ctx.store.inject_error(StoreOperation::GetWebhooksByAccount, 10).await;

    let event = EventBuilder::new().account(account_id);
    ctx.source.push(message(0, &event.message_value())).await;

    ctx.consumer.start().await.unwrap();
    assert!(ctx.source.wait_for_commit(&tp(), 1, WAIT).await);

    assert_eq!(ctx.store.call_count(StoreOperation::GetWebhooksByAccount).await, 3);
    let records = ctx.sink.records().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].error.contains("processing failed"), "{}", records[0].error);
    assert_eq!(ctx.consumer.stats().await.dead_lettered, 1);

    ctx.consumer.shutdown_graceful(WAIT).await.unwrap();
}

#[tokio::test]
async fn dead_letter_publish_is_retried_until_acknowledged() {
    let mut ctx = dispatch_context().await;
    ctx.sink.inject_publish_error(2).await;
    ctx.source.push(LogMessage::new("events", 0, 0, b"{not json".to_vec())).await;

    ctx.consumer.start().await.unwrap();
    assert!(ctx.source.wait_for_commit(&tp(), 1, WAIT).await);

    assert_eq!(ctx.sink.publish_attempts().await, 3);
    assert_eq!(ctx.sink.records().await.len(), 1);

    ctx.consumer.shutdown_graceful(WAIT).await.unwrap();
}

#[tokio::test]
async fn fetch_errors_do_not_stop_consumption() {
    let mut ctx = dispatch_context().await;
    ctx.source.inject_fetch_error(2).await;
    ctx.source.push(LogMessage::new("events", 0, 0, b"{}".to_vec())).await;

    ctx.consumer.start().await.unwrap();

    assert!(ctx.source.wait_for_commit(&tp(), 1, WAIT).await);
    ctx.consumer.shutdown_graceful(WAIT).await.unwrap();
}

/// Processor that holds events marked `{"hold": true}` until released.
struct GatedProcessor {
    gate: Semaphore,
    calls: AtomicUsize,
}

impl EventProcessor for GatedProcessor {
    fn process(
        &self,
        event: Event,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if event.data["hold"] == json!(true) {
                let permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| ConsumerError::processing(e.to_string()))?;
                permit.forget();
            }
            Ok(())
        })
    }
}

#[tokio::test]
async fn commit_waits_for_earliest_unfinished_offset() {
    let source = InMemoryEventSource::new();
    let processor =
        Arc::new(GatedProcessor { gate: Semaphore::new(0), calls: AtomicUsize::new(0) });
    let mut consumer = EventConsumer::new(
        Arc::new(source.clone()),
        Arc::new(InMemoryDeadLetterSink::new()),
        processor.clone(),
        fast_config(),
        Arc::new(RealClock::new()),
    );

    let account_id = AccountId::new();
    let held = EventBuilder::new().account(account_id).data(json!({"hold": true}));
    let free = EventBuilder::new().account(account_id);
    source.push(message(0, &held.message_value())).await;
    source.push(message(1, &free.message_value())).await;
    source.push(message(2, &free.message_value())).await;

    consumer.start().await.unwrap();
    wait_for_stats(&consumer, |s| s.processed == 2 && s.in_flight == 1).await;
    assert_eq!(source.committed(&tp()).await, None);

    processor.gate.add_permits(1);

    assert!(source.wait_for_commit(&tp(), 3, WAIT).await);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);

    consumer.shutdown_graceful(WAIT).await.unwrap();
}

struct FailingProcessor {
    calls: AtomicUsize,
}

impl EventProcessor for FailingProcessor {
    fn process(
        &self,
        _event: Event,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ConsumerError::processing("downstream unavailable"))
        })
    }
}

#[tokio::test]
async fn shutdown_during_retry_leaves_message_uncommitted() {
    let source = InMemoryEventSource::new();
    let sink = InMemoryDeadLetterSink::new();
    let processor = Arc::new(FailingProcessor { calls: AtomicUsize::new(0) });
    let config = ConsumerConfig {
        processing_retry_delay: Duration::from_secs(3600),
        ..fast_config()
    };
    let mut consumer = EventConsumer::new(
        Arc::new(source.clone()),
        Arc::new(sink.clone()),
        processor.clone(),
        config,
        Arc::new(RealClock::new()),
    );

    let event = EventBuilder::new().account(AccountId::new());
    source.push(message(0, &event.message_value())).await;

    consumer.start().await.unwrap();
    wait_for_stats(&consumer, |s| s.in_flight == 1).await;
    let poll = async {
        while processor.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT, poll).await.unwrap();

    consumer.shutdown_graceful(WAIT).await.unwrap();

    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(source.committed(&tp()).await, None);
    assert!(sink.records().await.is_empty());
}

#[tokio::test]
async fn exhausted_source_stops_workers() {
    let source = InMemoryEventSource::new();
    let processor =
        Arc::new(GatedProcessor { gate: Semaphore::new(0), calls: AtomicUsize::new(0) });
    let mut consumer = EventConsumer::new(
        Arc::new(source.clone()),
        Arc::new(InMemoryDeadLetterSink::new()),
        processor,
        fast_config(),
        Arc::new(RealClock::new()),
    );

    let event = EventBuilder::new().account(AccountId::new());
    source.push(message(0, &event.message_value())).await;
    source.close().await;

    consumer.start().await.unwrap();
    let stats = wait_for_stats(&consumer, |s| s.active_workers == 0).await;

    assert_eq!(stats.processed, 1);
    assert_eq!(source.committed(&tp()).await, Some(1));
    consumer.shutdown_graceful(WAIT).await.unwrap();
}
