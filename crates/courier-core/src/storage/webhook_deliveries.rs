//! Repository for webhook delivery records.
//!
//! Records are never deleted. A record that reached `success` is never
//! updated again, which the status guards in the update statements enforce.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{DeliveryId, DeliveryUpdate, WebhookDelivery},
};

const SELECT_COLUMNS: &str = r"
    SELECT id, webhook_id, event_type, payload, status, attempt_number,
           response_status, response_body, response_duration_ms, error_message,
           next_retry_at, created_at, updated_at
    FROM webhook_deliveries
";

/// Repository for delivery record operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new delivery record.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the webhook does not exist.
    pub async fn create(&self, delivery: &WebhookDelivery) -> Result<DeliveryId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO webhook_deliveries (
                id, webhook_id, event_type, payload, status, attempt_number,
                response_status, response_body, response_duration_ms, error_message,
                next_retry_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id
            ",
        )
        .bind(delivery.id.0)
        .bind(delivery.webhook_id.0)
        .bind(&delivery.event_type)
        .bind(&delivery.payload)
        .bind(delivery.status.to_string())
        .bind(delivery.attempt_number)
        .bind(delivery.response_status)
        .bind(&delivery.response_body)
        .bind(delivery.response_duration_ms)
        .bind(&delivery.error_message)
        .bind(delivery.next_retry_at)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(DeliveryId(id))
    }

    /// Finds a delivery record by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, delivery_id: DeliveryId) -> Result<Option<WebhookDelivery>> {
        let delivery =
            sqlx::query_as::<_, WebhookDelivery>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
                .bind(delivery_id.0)
                .fetch_optional(&*self.pool)
                .await?;

        Ok(delivery)
    }

    /// Writes the outcome of an attempt onto a delivery record.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the record does not exist or already
    /// succeeded.
    pub async fn update_status(
        &self,
        delivery_id: DeliveryId,
        update: &DeliveryUpdate,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE webhook_deliveries
            SET status = $2, response_status = $3, response_body = $4,
                response_duration_ms = $5, error_message = $6, next_retry_at = $7,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'success'
            ",
        )
        .bind(delivery_id.0)
        .bind(update.status.to_string())
        .bind(update.response_status)
        .bind(&update.response_body)
        .bind(update.response_duration_ms)
        .bind(&update.error_message)
        .bind(update.next_retry_at)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                delivery_id = %delivery_id,
                status = %update.status,
                "status update matched no open delivery"
            );
            return Err(CoreError::NotFound(format!("open delivery {delivery_id}")));
        }

        Ok(())
    }

    /// Atomically increments the attempt counter of a pending record and
    /// sets its next retry time.
    ///
    /// Returns the new attempt number.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the record is not pending.
    pub async fn increment_attempt(
        &self,
        delivery_id: DeliveryId,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<i32> {
        let attempt: Option<i32> = sqlx::query_scalar(
            r"
            UPDATE webhook_deliveries
            SET attempt_number = attempt_number + 1, next_retry_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING attempt_number
            ",
        )
        .bind(delivery_id.0)
        .bind(next_retry_at)
        .fetch_optional(&*self.pool)
        .await?;

        attempt.ok_or_else(|| CoreError::NotFound(format!("pending delivery {delivery_id}")))
    }

    /// Selects pending records whose retry time has passed.
    ///
    /// Only records with `attempt_number < max_attempt` are returned, oldest
    /// due first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_due(
        &self,
        limit: i64,
        max_attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>> {
        let deliveries = sqlx::query_as::<_, WebhookDelivery>(&format!(
            r"{SELECT_COLUMNS}
            WHERE status = 'pending'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
              AND attempt_number < $2
            ORDER BY next_retry_at ASC
            LIMIT $3"
        ))
        .bind(now)
        .bind(max_attempt)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        tracing::debug!(count = deliveries.len(), limit, max_attempt, "selected due deliveries");

        Ok(deliveries)
    }
}
