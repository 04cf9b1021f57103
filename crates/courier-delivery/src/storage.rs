//! Store abstraction consumed by the dispatcher and the retry scheduler.
//!
//! The relational records are owned by the surrounding application; this
//! trait is the contract the engine needs from them. Production uses the
//! PostgreSQL repositories from `courier_core::storage`, tests use the
//! in-memory `mock::MockWebhookStore`.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result, AccountId, Clock, DeliveryId, DeliveryUpdate, RealClock, Webhook,
    WebhookDelivery, WebhookId,
};

/// Store operations required by the delivery engine.
///
/// Counter and attempt increments must be atomic at the store. Each delivery
/// record has a single writer at a time, so last-writer-wins is acceptable
/// for status updates.
pub trait WebhookStore: Send + Sync + 'static {
    /// Returns every webhook owned by an account, including deleted and
    /// inactive ones.
    fn get_webhooks_by_account(
        &self,
        account_id: AccountId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Webhook>>> + Send + '_>>;

    /// Returns a webhook by ID, including a deleted one.
    fn get_webhook_by_id(
        &self,
        webhook_id: WebhookId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Webhook>>> + Send + '_>>;

    /// Persists a new delivery record.
    fn create_webhook_delivery(
        &self,
        delivery: WebhookDelivery,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryId>> + Send + '_>>;

    /// Writes the outcome of an attempt onto a delivery record.
    fn update_webhook_delivery_status(
        &self,
        delivery_id: DeliveryId,
        update: DeliveryUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Atomically increments a webhook's successful delivery counter.
    fn increment_webhook_sent(
        &self,
        webhook_id: WebhookId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Atomically increments a webhook's terminal failure counter.
    fn increment_webhook_failed(
        &self,
        webhook_id: WebhookId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Atomically increments a pending record's attempt counter and sets its
    /// next retry time. Returns the new attempt number.
    fn increment_delivery_attempt(
        &self,
        delivery_id: DeliveryId,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>>;

    /// Returns up to `limit` pending records whose retry time has passed and
    /// whose attempt number is below `max_attempt`.
    fn get_pending_webhook_deliveries(
        &self,
        limit: usize,
        max_attempt: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookDelivery>>> + Send + '_>>;
}

/// Production store backed by PostgreSQL.
pub struct PostgresWebhookStore {
    storage: Arc<courier_core::storage::Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresWebhookStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<courier_core::storage::Storage>) -> Self {
        Self::with_clock(storage, Arc::new(RealClock::new()))
    }

    /// Creates an adapter that evaluates retry due times against `clock`.
    pub fn with_clock(storage: Arc<courier_core::storage::Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl WebhookStore for PostgresWebhookStore {
    fn get_webhooks_by_account(
        &self,
        account_id: AccountId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Webhook>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.find_by_account(account_id).await })
    }

    fn get_webhook_by_id(
        &self,
        webhook_id: WebhookId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Webhook>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.find_by_id(webhook_id).await })
    }

    fn create_webhook_delivery(
        &self,
        delivery: WebhookDelivery,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryId>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhook_deliveries.create(&delivery).await })
    }

    fn update_webhook_delivery_status(
        &self,
        delivery_id: DeliveryId,
        update: DeliveryUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(
            async move { storage.webhook_deliveries.update_status(delivery_id, &update).await },
        )
    }

    fn increment_webhook_sent(
        &self,
        webhook_id: WebhookId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.increment_sent(webhook_id).await })
    }

    fn increment_webhook_failed(
        &self,
        webhook_id: WebhookId,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.webhooks.increment_failed(webhook_id).await })
    }

    fn increment_delivery_attempt(
        &self,
        delivery_id: DeliveryId,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.webhook_deliveries.increment_attempt(delivery_id, next_retry_at).await
        })
    }

    fn get_pending_webhook_deliveries(
        &self,
        limit: usize,
        max_attempt: i32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookDelivery>>> + Send + '_>> {
        let storage = self.storage.clone();
        let now = self.clock.now();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Box::pin(async move { storage.webhook_deliveries.find_due(limit, max_attempt, now).await })
    }
}

pub mod mock {
    //! In-memory store for exercising dispatch and retry logic without a
    //! database.
    //!
    //! Enforces the same guards as the SQL statements: successful records
    //! reject updates and only pending records can be claimed.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use courier_core::{
        error::{CoreError, Result},
        AccountId, Clock, DeliveryId, DeliveryStatus, DeliveryUpdate, RealClock, Webhook,
        WebhookDelivery, WebhookId,
    };
    use tokio::sync::RwLock;

    use super::WebhookStore;

    /// Store operation, used to inject failures and count calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum StoreOperation {
        /// `get_webhooks_by_account`
        GetWebhooksByAccount,
        /// `get_webhook_by_id`
        GetWebhookById,
        /// `create_webhook_delivery`
        CreateDelivery,
        /// `update_webhook_delivery_status`
        UpdateDeliveryStatus,
        /// `increment_webhook_sent`
        IncrementSent,
        /// `increment_webhook_failed`
        IncrementFailed,
        /// `increment_delivery_attempt`
        IncrementAttempt,
        /// `get_pending_webhook_deliveries`
        GetPendingDeliveries,
    }

    /// Mock store holding webhooks and delivery records in memory.
    pub struct MockWebhookStore {
        webhooks: Arc<RwLock<HashMap<WebhookId, Webhook>>>,
        deliveries: Arc<RwLock<HashMap<DeliveryId, WebhookDelivery>>>,
        attempt_trace: Arc<RwLock<HashMap<DeliveryId, Vec<i32>>>>,
        injected_errors: Arc<RwLock<HashMap<StoreOperation, usize>>>,
        calls: Arc<RwLock<HashMap<StoreOperation, usize>>>,
        clock: Arc<dyn Clock>,
    }

    impl MockWebhookStore {
        /// Creates an empty store on the real clock.
        pub fn new() -> Self {
            Self::with_clock(Arc::new(RealClock::new()))
        }

        /// Creates an empty store that evaluates due times against `clock`.
        pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
            Self {
                webhooks: Arc::new(RwLock::new(HashMap::new())),
                deliveries: Arc::new(RwLock::new(HashMap::new())),
                attempt_trace: Arc::new(RwLock::new(HashMap::new())),
                injected_errors: Arc::new(RwLock::new(HashMap::new())),
                calls: Arc::new(RwLock::new(HashMap::new())),
                clock,
            }
        }

        /// Adds or replaces a webhook.
        pub async fn add_webhook(&self, webhook: Webhook) {
            self.webhooks.write().await.insert(webhook.id, webhook);
        }

        /// Inserts a delivery record directly, bypassing call counting.
        pub async fn add_delivery(&self, delivery: WebhookDelivery) {
            self.attempt_trace.write().await.insert(delivery.id, vec![delivery.attempt_number]);
            self.deliveries.write().await.insert(delivery.id, delivery);
        }

        /// Makes the next `times` calls of `operation` fail with a database
        /// error.
        pub async fn inject_error(&self, operation: StoreOperation, times: usize) {
            self.injected_errors.write().await.insert(operation, times);
        }

        /// Returns how many times `operation` was called.
        pub async fn call_count(&self, operation: StoreOperation) -> usize {
            self.calls.read().await.get(&operation).copied().unwrap_or(0)
        }

        /// Returns the current state of a webhook.
        pub async fn webhook(&self, webhook_id: WebhookId) -> Option<Webhook> {
            self.webhooks.read().await.get(&webhook_id).cloned()
        }

        /// Returns the current state of a delivery record.
        pub async fn delivery(&self, delivery_id: DeliveryId) -> Option<WebhookDelivery> {
            self.deliveries.read().await.get(&delivery_id).cloned()
        }

        /// Returns all delivery records, oldest first.
        pub async fn deliveries(&self) -> Vec<WebhookDelivery> {
            let mut deliveries: Vec<_> = self.deliveries.read().await.values().cloned().collect();
            deliveries.sort_by_key(|d| (d.created_at, d.id));
            deliveries
        }

        /// Returns the delivery records of one webhook, oldest first.
        pub async fn deliveries_for(&self, webhook_id: WebhookId) -> Vec<WebhookDelivery> {
            self.deliveries().await.into_iter().filter(|d| d.webhook_id == webhook_id).collect()
        }

        /// Returns every attempt number a record has carried, in order.
        pub async fn attempt_trace(&self, delivery_id: DeliveryId) -> Vec<i32> {
            self.attempt_trace.read().await.get(&delivery_id).cloned().unwrap_or_default()
        }

        async fn enter(&self, operation: StoreOperation) -> Result<()> {
            *self.calls.write().await.entry(operation).or_insert(0) += 1;

            let mut injected = self.injected_errors.write().await;
            if let Some(remaining) = injected.get_mut(&operation) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(CoreError::Database(format!("injected {operation:?} failure")));
                }
            }
            Ok(())
        }
    }

    impl Default for MockWebhookStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl WebhookStore for MockWebhookStore {
        fn get_webhooks_by_account(
            &self,
            account_id: AccountId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Webhook>>> + Send + '_>> {
            Box::pin(async move {
                self.enter(StoreOperation::GetWebhooksByAccount).await?;

                let mut webhooks: Vec<_> = self
                    .webhooks
                    .read()
                    .await
                    .values()
                    .filter(|w| w.account_id == account_id)
                    .cloned()
                    .collect();
                webhooks.sort_by_key(|w| (w.created_at, w.id));
                Ok(webhooks)
            })
        }

        fn get_webhook_by_id(
            &self,
            webhook_id: WebhookId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Webhook>>> + Send + '_>> {
            Box::pin(async move {
                self.enter(StoreOperation::GetWebhookById).await?;
                Ok(self.webhooks.read().await.get(&webhook_id).cloned())
            })
        }

        fn create_webhook_delivery(
            &self,
            delivery: WebhookDelivery,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryId>> + Send + '_>> {
            Box::pin(async move {
                self.enter(StoreOperation::CreateDelivery).await?;

                let mut deliveries = self.deliveries.write().await;
                if deliveries.contains_key(&delivery.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "delivery {} already exists",
                        delivery.id
                    )));
                }
                let id = delivery.id;
                self.attempt_trace.write().await.insert(id, vec![delivery.attempt_number]);
                deliveries.insert(id, delivery);
                Ok(id)
            })
        }

        fn update_webhook_delivery_status(
            &self,
            delivery_id: DeliveryId,
            update: DeliveryUpdate,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.enter(StoreOperation::UpdateDeliveryStatus).await?;

                let now = self.clock.now();
                let mut deliveries = self.deliveries.write().await;
                match deliveries.get_mut(&delivery_id) {
                    Some(delivery) if delivery.status != DeliveryStatus::Success => {
                        delivery.apply(&update, now);
                        Ok(())
                    },
                    _ => Err(CoreError::NotFound(format!("open delivery {delivery_id}"))),
                }
            })
        }

        fn increment_webhook_sent(
            &self,
            webhook_id: WebhookId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.enter(StoreOperation::IncrementSent).await?;
                if let Some(webhook) = self.webhooks.write().await.get_mut(&webhook_id) {
                    webhook.sent_count += 1;
                }
                Ok(())
            })
        }

        fn increment_webhook_failed(
            &self,
            webhook_id: WebhookId,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.enter(StoreOperation::IncrementFailed).await?;
                if let Some(webhook) = self.webhooks.write().await.get_mut(&webhook_id) {
                    webhook.failed_count += 1;
                }
                Ok(())
            })
        }

        fn increment_delivery_attempt(
            &self,
            delivery_id: DeliveryId,
            next_retry_at: Option<DateTime<Utc>>,
        ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + '_>> {
            Box::pin(async move {
                self.enter(StoreOperation::IncrementAttempt).await?;

                let now = self.clock.now();
                let mut deliveries = self.deliveries.write().await;
                match deliveries.get_mut(&delivery_id) {
                    Some(delivery) if delivery.status == DeliveryStatus::Pending => {
                        delivery.attempt_number += 1;
                        delivery.next_retry_at = next_retry_at;
                        delivery.updated_at = now;
                        self.attempt_trace
                            .write()
                            .await
                            .entry(delivery_id)
                            .or_default()
                            .push(delivery.attempt_number);
                        Ok(delivery.attempt_number)
                    },
                    _ => Err(CoreError::NotFound(format!("pending delivery {delivery_id}"))),
                }
            })
        }

        fn get_pending_webhook_deliveries(
            &self,
            limit: usize,
            max_attempt: i32,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<WebhookDelivery>>> + Send + '_>> {
            Box::pin(async move {
                self.enter(StoreOperation::GetPendingDeliveries).await?;

                let now = self.clock.now();
                let mut due: Vec<_> = self
                    .deliveries
                    .read()
                    .await
                    .values()
                    .filter(|d| {
                        d.status == DeliveryStatus::Pending
                            && d.attempt_number < max_attempt
                            && d.next_retry_at.is_some_and(|at| at <= now)
                    })
                    .cloned()
                    .collect();
                due.sort_by_key(|d| (d.next_retry_at, d.id));
                due.truncate(limit);
                Ok(due)
            })
        }
    }
}
