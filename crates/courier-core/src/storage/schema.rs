//! Table and index definitions.
//!
//! Every statement is idempotent so the schema can be applied on each start.

use sqlx::PgPool;

use crate::error::Result;

const STATEMENTS: [&str; 5] = [
    r"
    CREATE TABLE IF NOT EXISTS webhooks (
        id UUID PRIMARY KEY,
        account_id UUID NOT NULL,
        campaign_id UUID,
        url TEXT NOT NULL,
        secret TEXT NOT NULL,
        events TEXT[] NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'active',
        retry_enabled BOOLEAN NOT NULL DEFAULT TRUE,
        max_retries INTEGER NOT NULL DEFAULT 5,
        sent_count BIGINT NOT NULL DEFAULT 0,
        failed_count BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        deleted_at TIMESTAMPTZ
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id UUID PRIMARY KEY,
        webhook_id UUID NOT NULL REFERENCES webhooks(id),
        event_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempt_number INTEGER NOT NULL DEFAULT 1,
        response_status INTEGER,
        response_body TEXT,
        response_duration_ms BIGINT,
        error_message TEXT,
        next_retry_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhooks_account
    ON webhooks(account_id, created_at)
    WHERE deleted_at IS NULL
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_due
    ON webhook_deliveries(next_retry_at)
    WHERE status = 'pending'
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_deliveries_webhook
    ON webhook_deliveries(webhook_id, created_at DESC)
    ",
];

/// Creates the webhook and delivery tables and their indexes if missing.
///
/// # Errors
///
/// Returns `CoreError::Database` if a statement fails.
pub async fn apply(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    tracing::debug!(statements = STATEMENTS.len(), "schema applied");
    Ok(())
}
