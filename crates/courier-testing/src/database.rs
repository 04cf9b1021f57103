//! Isolated PostgreSQL databases for storage tests.
//!
//! Every handle owns a freshly created database with the Courier schema
//! applied, so tests never see each other's rows. The server comes from
//! `DATABASE_URL`; when it is not set the constructor returns `None` and the
//! test skips itself.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_core::storage::Storage;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

const ADMIN_DATABASE: &str = "postgres";

/// A throwaway database with the schema applied.
#[derive(Debug)]
pub struct TestDatabase {
    pool: PgPool,
    admin_pool: PgPool,
    database_name: String,
}

impl TestDatabase {
    /// Creates an isolated database on the server named by `DATABASE_URL`.
    ///
    /// Returns `Ok(None)` if `DATABASE_URL` is not set.
    ///
    /// # Errors
    ///
    /// Returns error if the server is unreachable or the database cannot be
    /// created and migrated.
    pub async fn from_env() -> Result<Option<Self>> {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            warn!("DATABASE_URL is not set, skipping database test");
            return Ok(None);
        };

        let options = database_url
            .parse::<PgConnectOptions>()
            .context("failed to parse DATABASE_URL")?;

        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options.clone().database(ADMIN_DATABASE))
            .await
            .context("failed to connect to admin database")?;

        let database_name = format!("courier_test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
            .execute(&admin_pool)
            .await
            .with_context(|| format!("failed to create database {database_name}"))?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(options.database(&database_name))
            .await
            .with_context(|| format!("failed to connect to database {database_name}"))?;

        Storage::new(pool.clone()).migrate().await.context("failed to apply schema")?;

        info!(database = %database_name, "created isolated test database");
        Ok(Some(Self { pool, admin_pool, database_name }))
    }

    /// Connection pool of the test database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Storage repositories over the test database.
    pub fn storage(&self) -> Storage {
        Storage::new(self.pool.clone())
    }

    /// Closes all connections and drops the database.
    ///
    /// # Errors
    ///
    /// Returns error if the database cannot be dropped.
    pub async fn drop_database(self) -> Result<()> {
        self.pool.close().await;

        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.database_name))
            .execute(&self.admin_pool)
            .await
            .with_context(|| format!("failed to drop database {}", self.database_name))?;

        debug!(database = %self.database_name, "dropped test database");
        self.admin_pool.close().await;
        Ok(())
    }
}
