//! Core domain models and storage for the Courier delivery engine.
//!
//! Provides strongly-typed identifiers, the webhook and delivery records the
//! engine reads and mutates, the wire payload sent to subscribers, error
//! handling, and a clock abstraction used for deterministic tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    generate_secret, AccountId, CampaignId, DeliveryId, DeliveryStatus, DeliveryUpdate, Event,
    EventEnvelope, EventId, Webhook, WebhookDelivery, WebhookId, WebhookPayload, WebhookStatus,
};
pub use time::{Clock, RealClock, TestClock};
