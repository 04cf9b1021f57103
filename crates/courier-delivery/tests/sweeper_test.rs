//! Retry scheduler behavior over the full delivery lifecycle.

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use courier_core::{AccountId, Clock, DeliveryStatus, WebhookStatus};
use courier_delivery::{
    storage::mock::{MockWebhookStore, StoreOperation},
    ClientConfig, DeliveryClient, DeliveryConfig, Dispatcher, RetryScheduler, SweepReport,
    SweeperConfig, WebhookStore,
};
use courier_testing::{MockResponse, MockServer, TestClock, WebhookBuilder};
use serde_json::json;

struct TestContext {
    store: Arc<MockWebhookStore>,
    clock: Arc<TestClock>,
    dispatcher: Dispatcher,
    scheduler: RetryScheduler,
    server: MockServer,
}

async fn context() -> TestContext {
    let clock =
        Arc::new(TestClock::starting_at(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
    let store = Arc::new(MockWebhookStore::with_clock(clock.clone()));
    let config = ClientConfig { timeout: Duration::from_secs(2), ..ClientConfig::default() };
    let client = Arc::new(DeliveryClient::with_clock(config, clock.clone()).unwrap());
    let dispatcher =
        Dispatcher::new(store.clone(), client.clone(), clock.clone(), DeliveryConfig::default());
    let scheduler =
        RetryScheduler::new(store.clone(), client, clock.clone(), SweeperConfig::default());
    let server = MockServer::start().await;

    TestContext { store, clock, dispatcher, scheduler, server }
}

#[tokio::test]
async fn not_due_before_backoff_elapses() {
    let ctx = context().await;
    ctx.server.respond("/hook", MockResponse::status(500)).await;

    let account_id = AccountId::new();
    let webhook =
        WebhookBuilder::new().account(account_id).url(ctx.server.endpoint("/hook")).build();
    ctx.store.add_webhook(webhook).await;
    ctx.dispatcher.dispatch_event(account_id, None, "user.created", json!({})).await.unwrap();

    ctx.clock.advance(Duration::from_secs(1));
    assert_eq!(ctx.scheduler.run_once().await.unwrap(), SweepReport::default());

    ctx.clock.advance(Duration::from_secs(1));
    assert_eq!(ctx.scheduler.run_once().await.unwrap().selected, 1);
}

#[tokio::test]
async fn recovers_after_transient_failures() {
    let ctx = context().await;
    ctx.server.respond_sequence("/hook", &[500, 502, 200]).await;

    let account_id = AccountId::new();
    let webhook =
        WebhookBuilder::new().account(account_id).url(ctx.server.endpoint("/hook")).build();
    ctx.store.add_webhook(webhook.clone()).await;
    ctx.dispatcher.dispatch_event(account_id, None, "user.created", json!({})).await.unwrap();

    ctx.clock.advance(Duration::from_secs(2));
    let report = ctx.scheduler.run_once().await.unwrap();
    assert_eq!(report, SweepReport { selected: 1, rescheduled: 1, ..SweepReport::default() });

    let delivery = &ctx.store.deliveries_for(webhook.id).await[0];
    assert_eq!(delivery.attempt_number, 2);
    assert_eq!(delivery.next_retry_at, Some(ctx.clock.now() + chrono::Duration::seconds(10)));

    ctx.clock.advance(Duration::from_secs(10));
    let report = ctx.scheduler.run_once().await.unwrap();
    assert_eq!(report, SweepReport { selected: 1, delivered: 1, ..SweepReport::default() });

    let delivery = &ctx.store.deliveries_for(webhook.id).await[0];
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_number, 3);
    assert_eq!(delivery.response_status, Some(200));
    assert_eq!(ctx.store.attempt_trace(delivery.id).await, vec![1, 2, 3]);

    let webhook = ctx.store.webhook(webhook.id).await.unwrap();
    assert_eq!(webhook.sent_count, 1);
    assert_eq!(webhook.failed_count, 0);

    // Every attempt carried the same payload bytes.
    let requests = ctx.server.requests_to("/hook").await;
    let bodies: Vec<_> = requests.into_iter().map(|r| r.body).collect();
    assert_eq!(bodies.len(), 3);
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));

    ctx.clock.advance(Duration::from_secs(600));
    assert_eq!(ctx.scheduler.run_once().await.unwrap(), SweepReport::default());
}

#[tokio::test]
async fn exhausts_after_max_retries() {
    let ctx = context().await;
    ctx.server.respond("/hook", MockResponse::status(500)).await;

    let account_id = AccountId::new();
    let webhook = WebhookBuilder::new()
        .account(account_id)
        .url(ctx.server.endpoint("/hook"))
        .max_retries(3)
        .build();
    ctx.store.add_webhook(webhook.clone()).await;
    ctx.dispatcher.dispatch_event(account_id, None, "user.created", json!({})).await.unwrap();

    ctx.clock.advance(Duration::from_secs(2));
    assert_eq!(ctx.scheduler.run_once().await.unwrap().rescheduled, 1);

    ctx.clock.advance(Duration::from_secs(10));
    let report = ctx.scheduler.run_once().await.unwrap();
    assert_eq!(report, SweepReport { selected: 1, exhausted: 1, ..SweepReport::default() });

    let delivery = &ctx.store.deliveries_for(webhook.id).await[0];
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt_number, 3);
    assert_eq!(delivery.next_retry_at, None);

    let webhook = ctx.store.webhook(webhook.id).await.unwrap();
    assert_eq!(webhook.failed_count, 1);
    assert_eq!(webhook.status, WebhookStatus::Active);

    ctx.clock.advance(Duration::from_secs(3600));
    assert_eq!(ctx.scheduler.run_once().await.unwrap(), SweepReport::default());
    ctx.server.assert_request_count(3).await;
}

#[tokio::test]
async fn paused_webhook_closes_pending_delivery() {
    let ctx = context().await;
    ctx.server.respond("/hook", MockResponse::status(500)).await;

    let account_id = AccountId::new();
    let webhook =
        WebhookBuilder::new().account(account_id).url(ctx.server.endpoint("/hook")).build();
    ctx.store.add_webhook(webhook.clone()).await;
    ctx.dispatcher.dispatch_event(account_id, None, "user.created", json!({})).await.unwrap();

    let mut paused = webhook.clone();
    paused.status = WebhookStatus::Paused;
    ctx.store.add_webhook(paused).await;

    ctx.clock.advance(Duration::from_secs(2));
    let report = ctx.scheduler.run_once().await.unwrap();

    assert_eq!(report, SweepReport { selected: 1, skipped: 1, ..SweepReport::default() });
    let delivery = &ctx.store.deliveries_for(webhook.id).await[0];
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt_number, 1);
    assert_eq!(delivery.error_message.as_deref(), Some("webhook is not active"));
    assert_eq!(ctx.store.webhook(webhook.id).await.unwrap().failed_count, 0);
    ctx.server.assert_request_count(1).await;
}

#[tokio::test]
async fn claim_failure_leaves_delivery_for_next_sweep() {
    let ctx = context().await;
    ctx.server.respond_sequence("/hook", &[500, 200]).await;

    let account_id = AccountId::new();
    let webhook =
        WebhookBuilder::new().account(account_id).url(ctx.server.endpoint("/hook")).build();
    ctx.store.add_webhook(webhook.clone()).await;
    ctx.dispatcher.dispatch_event(account_id, None, "user.created", json!({})).await.unwrap();

    ctx.clock.advance(Duration::from_secs(2));
    ctx.store.inject_error(StoreOperation::IncrementAttempt, 1).await;
    assert_eq!(ctx.scheduler.run_once().await.unwrap().skipped, 1);

    let report = ctx.scheduler.run_once().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(ctx.store.deliveries_for(webhook.id).await[0].attempt_number, 2);
}

#[tokio::test]
async fn listing_failure_is_reported() {
    let ctx = context().await;
    ctx.store.inject_error(StoreOperation::GetPendingDeliveries, 1).await;

    assert!(ctx.scheduler.run_once().await.is_err());
    assert!(ctx.scheduler.run_once().await.is_ok());
}

#[tokio::test]
async fn successful_delivery_is_immutable() {
    let ctx = context().await;
    ctx.server.respond("/hook", MockResponse::ok()).await;

    let account_id = AccountId::new();
    let webhook =
        WebhookBuilder::new().account(account_id).url(ctx.server.endpoint("/hook")).build();
    ctx.store.add_webhook(webhook.clone()).await;
    ctx.dispatcher.dispatch_event(account_id, None, "user.created", json!({})).await.unwrap();

    let delivery = ctx.store.deliveries_for(webhook.id).await.remove(0);
    assert_eq!(delivery.status, DeliveryStatus::Success);

    let store: &dyn WebhookStore = ctx.store.as_ref();
    assert!(store.increment_delivery_attempt(delivery.id, None).await.is_err());
    assert!(store
        .update_webhook_delivery_status(
            delivery.id,
            courier_core::DeliveryUpdate::abandoned("late write")
        )
        .await
        .is_err());

    assert_eq!(ctx.store.delivery(delivery.id).await.unwrap(), delivery);
}

#[tokio::test]
async fn two_attempt_webhook_fails_after_second_attempt() {
    let ctx = context().await;
    ctx.server.respond("/hook", MockResponse::status(500)).await;

    let account_id = AccountId::new();
    let webhook = WebhookBuilder::new()
        .account(account_id)
        .url(ctx.server.endpoint("/hook"))
        .max_retries(2)
        .build();
    ctx.store.add_webhook(webhook.clone()).await;
    let summary =
        ctx.dispatcher.dispatch_event(account_id, None, "user.created", json!({})).await.unwrap();
    assert_eq!(summary.retry_scheduled, 1);
    assert_eq!(ctx.store.webhook(webhook.id).await.unwrap().failed_count, 0);

    ctx.clock.advance(Duration::from_secs(2));
    let report = ctx.scheduler.run_once().await.unwrap();
    assert_eq!(report, SweepReport { selected: 1, exhausted: 1, ..SweepReport::default() });

    let delivery = &ctx.store.deliveries_for(webhook.id).await[0];
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt_number, 2);
    assert_eq!(delivery.next_retry_at, None);
    assert_eq!(ctx.store.webhook(webhook.id).await.unwrap().failed_count, 1);

    ctx.clock.advance(Duration::from_secs(3600));
    assert_eq!(ctx.scheduler.run_once().await.unwrap(), SweepReport::default());
    ctx.server.assert_request_count(2).await;
}

#[tokio::test]
async fn lost_retry_outcome_is_retried_when_claim_expires() {
    let ctx = context().await;
    ctx.server.respond_sequence("/hook", &[500, 500, 200]).await;

    let account_id = AccountId::new();
    let webhook =
        WebhookBuilder::new().account(account_id).url(ctx.server.endpoint("/hook")).build();
    ctx.store.add_webhook(webhook.clone()).await;
    ctx.dispatcher.dispatch_event(account_id, None, "user.created", json!({})).await.unwrap();

    ctx.clock.advance(Duration::from_secs(2));
    ctx.store.inject_error(StoreOperation::UpdateDeliveryStatus, 1).await;
    let report = ctx.scheduler.run_once().await.unwrap();
    assert_eq!(report, SweepReport { selected: 1, unrecorded: 1, ..SweepReport::default() });

    let delivery = &ctx.store.deliveries_for(webhook.id).await[0];
    assert_eq!(delivery.status, DeliveryStatus::Pending);
    assert_eq!(delivery.attempt_number, 2);
    // 2s client timeout plus the claim margin
    assert_eq!(delivery.next_retry_at, Some(ctx.clock.now() + chrono::Duration::seconds(32)));

    ctx.clock.advance(Duration::from_secs(31));
    assert_eq!(ctx.scheduler.run_once().await.unwrap(), SweepReport::default());

    ctx.clock.advance(Duration::from_secs(1));
    let report = ctx.scheduler.run_once().await.unwrap();
    assert_eq!(report, SweepReport { selected: 1, delivered: 1, ..SweepReport::default() });

    let delivery = &ctx.store.deliveries_for(webhook.id).await[0];
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_number, 3);
    let webhook = ctx.store.webhook(webhook.id).await.unwrap();
    assert_eq!(webhook.sent_count, 1);
    assert_eq!(webhook.failed_count, 0);
}

#[tokio::test]
async fn lost_first_outcome_is_picked_up_by_scheduler() {
    let ctx = context().await;
    ctx.server.respond("/hook", MockResponse::ok()).await;

    let account_id = AccountId::new();
    let webhook =
        WebhookBuilder::new().account(account_id).url(ctx.server.endpoint("/hook")).build();
    ctx.store.add_webhook(webhook.clone()).await;
    ctx.store.inject_error(StoreOperation::UpdateDeliveryStatus, 1).await;

    let summary =
        ctx.dispatcher.dispatch_event(account_id, None, "user.created", json!({})).await.unwrap();
    assert_eq!(summary.unrecorded, 1);

    ctx.clock.advance(Duration::from_secs(32));
    let report = ctx.scheduler.run_once().await.unwrap();
    assert_eq!(report, SweepReport { selected: 1, delivered: 1, ..SweepReport::default() });

    let delivery = &ctx.store.deliveries_for(webhook.id).await[0];
    assert_eq!(delivery.status, DeliveryStatus::Success);
    assert_eq!(delivery.attempt_number, 2);
    assert_eq!(ctx.store.webhook(webhook.id).await.unwrap().sent_count, 1);
    ctx.server.assert_request_count(2).await;
}

#[tokio::test]
async fn lost_final_outcome_closes_without_another_attempt() {
    let ctx = context().await;
    ctx.server.respond("/hook", MockResponse::status(500)).await;

    let account_id = AccountId::new();
    let webhook = WebhookBuilder::new()
        .account(account_id)
        .url(ctx.server.endpoint("/hook"))
        .max_retries(2)
        .build();
    ctx.store.add_webhook(webhook.clone()).await;
    ctx.dispatcher.dispatch_event(account_id, None, "user.created", json!({})).await.unwrap();

    ctx.clock.advance(Duration::from_secs(2));
    ctx.store.inject_error(StoreOperation::UpdateDeliveryStatus, 1).await;
    assert_eq!(ctx.scheduler.run_once().await.unwrap().unrecorded, 1);

    ctx.clock.advance(Duration::from_secs(32));
    let report = ctx.scheduler.run_once().await.unwrap();
    assert_eq!(report, SweepReport { selected: 1, exhausted: 1, ..SweepReport::default() });

    let delivery = &ctx.store.deliveries_for(webhook.id).await[0];
    assert_eq!(delivery.status, DeliveryStatus::Failed);
    assert_eq!(delivery.attempt_number, 2);
    assert_eq!(delivery.next_retry_at, None);
    assert_eq!(ctx.store.webhook(webhook.id).await.unwrap().failed_count, 1);
    ctx.server.assert_request_count(2).await;
}
