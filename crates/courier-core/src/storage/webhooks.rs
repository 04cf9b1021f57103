//! Repository for webhook subscriptions.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{AccountId, Webhook, WebhookId},
};

const SELECT_COLUMNS: &str = r"
    SELECT id, account_id, campaign_id, url, secret, events, status,
           retry_enabled, max_retries, sent_count, failed_count,
           created_at, updated_at, deleted_at
    FROM webhooks
";

/// Repository for webhook database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a webhook with its counters and timestamps as given.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or constraints are violated.
    pub async fn create(&self, webhook: &Webhook) -> Result<WebhookId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO webhooks (
                id, account_id, campaign_id, url, secret, events, status,
                retry_enabled, max_retries, sent_count, failed_count,
                created_at, updated_at, deleted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id
            ",
        )
        .bind(webhook.id.0)
        .bind(webhook.account_id.0)
        .bind(webhook.campaign_id.map(|c| c.0))
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(&webhook.events)
        .bind(webhook.status.to_string())
        .bind(webhook.retry_enabled)
        .bind(webhook.max_retries)
        .bind(webhook.sent_count)
        .bind(webhook.failed_count)
        .bind(webhook.created_at)
        .bind(webhook.updated_at)
        .bind(webhook.deleted_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(WebhookId(id))
    }

    /// Finds a webhook by ID, including soft-deleted ones.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, webhook_id: WebhookId) -> Result<Option<Webhook>> {
        let webhook = sqlx::query_as::<_, Webhook>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(webhook_id.0)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(webhook)
    }

    /// Finds all webhooks owned by an account.
    ///
    /// Soft-deleted and inactive webhooks are included; dispatch filters them.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_account(&self, account_id: AccountId) -> Result<Vec<Webhook>> {
        let webhooks = sqlx::query_as::<_, Webhook>(&format!(
            "{SELECT_COLUMNS} WHERE account_id = $1 ORDER BY created_at ASC"
        ))
        .bind(account_id.0)
        .fetch_all(&*self.pool)
        .await?;

        Ok(webhooks)
    }

    /// Atomically increments the successful delivery counter.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn increment_sent(&self, webhook_id: WebhookId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE webhooks
            SET sent_count = sent_count + 1, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(webhook_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Atomically increments the terminal failure counter.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn increment_failed(&self, webhook_id: WebhookId) -> Result<()> {
        sqlx::query(
            r"
            UPDATE webhooks
            SET failed_count = failed_count + 1, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(webhook_id.0)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
