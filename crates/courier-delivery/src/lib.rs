//! Signed webhook delivery for the Courier event engine.
//!
//! This crate turns events into HTTP callbacks and keeps retrying the ones
//! that failed until they succeed or run out of attempts.
//!
//! # Architecture
//!
//! - **Signing** - HMAC-SHA256 over `"{timestamp}.{payload}"`, carried in
//!   `X-Webhook-Signature`
//! - **Client** - one POST per call, success iff 2xx, response body capped
//!   for audit
//! - **Dispatch** - fan-out of one event to every subscribed webhook of an
//!   account, first attempt inline
//! - **Retry policy** - fixed backoff table with a flat five minute tail
//! - **Sweeper** - periodic retry of deliveries whose retry time has passed
//!
//! Delivery state lives behind the [`storage::WebhookStore`] trait so the
//! dispatcher and sweeper run unchanged against PostgreSQL or the in-memory
//! mock.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::Storage, RealClock};
//! use courier_delivery::{
//!     DeliveryClient, DeliveryConfig, Dispatcher, PostgresWebhookStore, Result,
//! };
//! use serde_json::json;
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> Result<()> {
//! let store = Arc::new(PostgresWebhookStore::new(Arc::new(Storage::new(pool))));
//! let client = Arc::new(DeliveryClient::with_defaults()?);
//! let dispatcher =
//!     Dispatcher::new(store, client, Arc::new(RealClock::new()), DeliveryConfig::default());
//!
//! let account_id = courier_core::AccountId::new();
//! dispatcher.dispatch_event(account_id, None, "user.created", json!({"id": 1})).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod client;
pub mod dispatch;
pub mod error;
pub mod retry;
pub mod signing;
pub mod storage;
pub mod sweeper;

pub use client::{ClientConfig, DeliveryClient, DeliveryResponse};
pub use dispatch::{AttemptOutcome, DeliveryConfig, DeliveryRecord, DispatchSummary, Dispatcher};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use retry::{backoff_for_attempt, RetryDecision, RetryPolicy};
pub use storage::{PostgresWebhookStore, WebhookStore};
pub use sweeper::{RetryScheduler, SweepReport, SweeperConfig};

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

/// Default ceiling on attempts per delivery.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 25;

/// Default time between retry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of deliveries retried per sweep.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 100;
