//! Database access layer for webhook subscriptions and delivery records.
//!
//! Counters and attempt numbers are changed with single `UPDATE ... SET x = x
//! + 1` statements so concurrent writers never lose an increment.

use std::sync::Arc;

use sqlx::PgPool;

pub mod schema;
pub mod webhook_deliveries;
pub mod webhooks;

use crate::error::Result;

/// Container for all repository instances.
#[derive(Clone)]
pub struct Storage {
    /// Repository for webhook subscriptions.
    pub webhooks: Arc<webhooks::Repository>,

    /// Repository for delivery records.
    pub webhook_deliveries: Arc<webhook_deliveries::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            webhooks: Arc::new(webhooks::Repository::new(pool.clone())),
            webhook_deliveries: Arc::new(webhook_deliveries::Repository::new(pool)),
        }
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.webhooks.pool()).await?;

        Ok(())
    }

    /// Creates any missing tables and indexes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if a schema statement fails.
    pub async fn migrate(&self) -> Result<()> {
        schema::apply(&self.webhooks.pool()).await
    }
}
