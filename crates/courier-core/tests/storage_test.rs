//! Integration tests for the PostgreSQL repositories.
//!
//! Each test runs against its own database created from `DATABASE_URL` and
//! returns early when no server is configured.

use chrono::{DateTime, Duration, TimeZone, Utc};
use courier_core::{
    storage::Storage, AccountId, CampaignId, CoreError, DeliveryId, DeliveryStatus,
    DeliveryUpdate, Webhook, WebhookDelivery, WebhookId, WebhookStatus,
};
use courier_testing::{TestDatabase, WebhookBuilder};
use serde_json::json;

async fn database() -> Option<TestDatabase> {
    TestDatabase::from_env().await.unwrap()
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

async fn insert_webhook(storage: &Storage, webhook: Webhook) -> Webhook {
    storage.webhooks.create(&webhook).await.unwrap();
    webhook
}

async fn insert_delivery(
    storage: &Storage,
    webhook: &Webhook,
    configure: impl FnOnce(&mut WebhookDelivery),
) -> DeliveryId {
    let mut delivery = WebhookDelivery::pending(
        DeliveryId::new(),
        webhook.id,
        "user.created",
        json!({"type": "user.created", "data": {"user_id": "usr_1"}}),
        now(),
    );
    configure(&mut delivery);
    storage.webhook_deliveries.create(&delivery).await.unwrap()
}

#[tokio::test]
async fn health_check_and_repeated_migration() {
    let Some(db) = database().await else { return };
    let storage = db.storage();

    assert!(storage.health_check().await.is_ok());
    storage.migrate().await.unwrap();

    db.drop_database().await.unwrap();
}

#[tokio::test]
async fn webhook_columns_round_trip() {
    let Some(db) = database().await else { return };
    let storage = db.storage();

    let campaign_id = CampaignId::new();
    let webhook = insert_webhook(
        &storage,
        WebhookBuilder::new()
            .campaign(campaign_id)
            .url("https://example.com/hooks")
            .secret("whsec_fixed")
            .events(&["user.created", "order.paid"])
            .status(WebhookStatus::Paused)
            .retries_disabled()
            .max_retries(7)
            .build(),
    )
    .await;

    let found = storage.webhooks.find_by_id(webhook.id).await.unwrap().unwrap();
    assert_eq!(found.account_id, webhook.account_id);
    assert_eq!(found.campaign_id, Some(campaign_id));
    assert_eq!(found.url, "https://example.com/hooks");
    assert_eq!(found.secret, "whsec_fixed");
    assert_eq!(found.events, vec!["user.created".to_string(), "order.paid".to_string()]);
    assert_eq!(found.status, WebhookStatus::Paused);
    assert!(!found.retry_enabled);
    assert_eq!(found.max_retries, 7);
    assert_eq!((found.sent_count, found.failed_count), (0, 0));
    assert!(found.deleted_at.is_none());

    assert!(storage.webhooks.find_by_id(WebhookId::new()).await.unwrap().is_none());

    db.drop_database().await.unwrap();
}

#[tokio::test]
async fn find_by_account_includes_deleted_and_excludes_other_accounts() {
    let Some(db) = database().await else { return };
    let storage = db.storage();

    let account_id = AccountId::new();
    let live = insert_webhook(&storage, WebhookBuilder::new().account(account_id).build()).await;
    let deleted =
        insert_webhook(&storage, WebhookBuilder::new().account(account_id).deleted().build())
            .await;
    insert_webhook(&storage, WebhookBuilder::new().build()).await;

    let mut ids: Vec<_> = storage
        .webhooks
        .find_by_account(account_id)
        .await
        .unwrap()
        .into_iter()
        .map(|w| w.id)
        .collect();
    ids.sort();
    let mut expected = vec![live.id, deleted.id];
    expected.sort();
    assert_eq!(ids, expected);

    db.drop_database().await.unwrap();
}

#[tokio::test]
async fn concurrent_counter_increments_are_not_lost() {
    let Some(db) = database().await else { return };
    let storage = db.storage();
    let webhook_id = insert_webhook(&storage, WebhookBuilder::new().build()).await.id;

    let mut handles = Vec::new();
    for i in 0..12 {
        let webhooks = storage.webhooks.clone();
        handles.push(tokio::spawn(async move {
            if i % 4 == 0 {
                webhooks.increment_failed(webhook_id).await
            } else {
                webhooks.increment_sent(webhook_id).await
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let found = storage.webhooks.find_by_id(webhook_id).await.unwrap().unwrap();
    assert_eq!(found.sent_count, 9);
    assert_eq!(found.failed_count, 3);

    db.drop_database().await.unwrap();
}

#[tokio::test]
async fn delivery_columns_round_trip() {
    let Some(db) = database().await else { return };
    let storage = db.storage();
    let webhook = insert_webhook(&storage, WebhookBuilder::new().build()).await;

    let retry_at = now() + Duration::seconds(32);
    let id = insert_delivery(&storage, &webhook, |d| d.next_retry_at = Some(retry_at)).await;

    let found = storage.webhook_deliveries.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(found.webhook_id, webhook.id);
    assert_eq!(found.event_type, "user.created");
    assert_eq!(found.payload["data"]["user_id"], "usr_1");
    assert_eq!(found.status, DeliveryStatus::Pending);
    assert_eq!(found.attempt_number, 1);
    assert_eq!(found.next_retry_at, Some(retry_at));
    assert_eq!(found.created_at, now());

    db.drop_database().await.unwrap();
}

#[tokio::test]
async fn delivery_for_unknown_webhook_is_rejected() {
    let Some(db) = database().await else { return };
    let storage = db.storage();
    let orphan = WebhookBuilder::new().build();

    let delivery = WebhookDelivery::pending(
        DeliveryId::new(),
        orphan.id,
        "user.created",
        json!({}),
        now(),
    );
    let err = storage.webhook_deliveries.create(&delivery).await.unwrap_err();

    assert!(matches!(err, CoreError::ConstraintViolation(_)));

    db.drop_database().await.unwrap();
}

#[tokio::test]
async fn successful_delivery_rejects_further_writes() {
    let Some(db) = database().await else { return };
    let storage = db.storage();
    let webhook = insert_webhook(&storage, WebhookBuilder::new().build()).await;
    let id = insert_delivery(&storage, &webhook, |_| {}).await;

    let delivered = DeliveryUpdate {
        status: DeliveryStatus::Success,
        response_status: Some(200),
        response_body: Some("OK".to_string()),
        response_duration_ms: Some(12),
        error_message: None,
        next_retry_at: None,
    };
    storage.webhook_deliveries.update_status(id, &delivered).await.unwrap();

    let err = storage
        .webhook_deliveries
        .update_status(id, &DeliveryUpdate::abandoned("late write"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));

    let err = storage.webhook_deliveries.increment_attempt(id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));

    let found = storage.webhook_deliveries.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(found.status, DeliveryStatus::Success);
    assert_eq!(found.response_status, Some(200));
    assert_eq!(found.response_body.as_deref(), Some("OK"));
    assert_eq!(found.response_duration_ms, Some(12));
    assert_eq!(found.attempt_number, 1);

    db.drop_database().await.unwrap();
}

#[tokio::test]
async fn failed_delivery_can_be_closed_but_not_claimed() {
    let Some(db) = database().await else { return };
    let storage = db.storage();
    let webhook = insert_webhook(&storage, WebhookBuilder::new().build()).await;
    let id = insert_delivery(&storage, &webhook, |_| {}).await;

    let retry_at = now() + Duration::seconds(10);
    assert_eq!(
        storage.webhook_deliveries.increment_attempt(id, Some(retry_at)).await.unwrap(),
        2
    );
    let found = storage.webhook_deliveries.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(found.next_retry_at, Some(retry_at));

    storage
        .webhook_deliveries
        .update_status(id, &DeliveryUpdate::abandoned("webhook was deleted"))
        .await
        .unwrap();

    let err = storage.webhook_deliveries.increment_attempt(id, None).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));

    let found = storage.webhook_deliveries.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(found.status, DeliveryStatus::Failed);
    assert_eq!(found.attempt_number, 2);
    assert_eq!(found.next_retry_at, None);
    assert_eq!(found.error_message.as_deref(), Some("webhook was deleted"));

    db.drop_database().await.unwrap();
}

#[tokio::test]
async fn find_due_filters_orders_and_limits() {
    let Some(db) = database().await else { return };
    let storage = db.storage();
    let webhook = insert_webhook(&storage, WebhookBuilder::new().build()).await;
    let at = |seconds: i64| Some(now() + Duration::seconds(seconds));

    let due_30 = insert_delivery(&storage, &webhook, |d| d.next_retry_at = at(-30)).await;
    let due_60 = insert_delivery(&storage, &webhook, |d| d.next_retry_at = at(-60)).await;
    let due_now = insert_delivery(&storage, &webhook, |d| d.next_retry_at = at(0)).await;
    insert_delivery(&storage, &webhook, |d| d.next_retry_at = at(60)).await;
    insert_delivery(&storage, &webhook, |d| d.next_retry_at = None).await;
    insert_delivery(&storage, &webhook, |d| {
        d.status = DeliveryStatus::Failed;
        d.next_retry_at = at(-120);
    })
    .await;
    let at_ceiling = insert_delivery(&storage, &webhook, |d| {
        d.attempt_number = 5;
        d.next_retry_at = at(-90);
    })
    .await;

    let ids = |deliveries: Vec<WebhookDelivery>| -> Vec<DeliveryId> {
        deliveries.into_iter().map(|d| d.id).collect()
    };

    let due = storage.webhook_deliveries.find_due(10, 5, now()).await.unwrap();
    assert_eq!(ids(due), vec![due_60, due_30, due_now]);

    let limited = storage.webhook_deliveries.find_due(2, 5, now()).await.unwrap();
    assert_eq!(ids(limited), vec![due_60, due_30]);

    let raised = storage.webhook_deliveries.find_due(10, 6, now()).await.unwrap();
    assert_eq!(ids(raised), vec![at_ceiling, due_60, due_30, due_now]);

    db.drop_database().await.unwrap();
}
