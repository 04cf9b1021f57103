//! Test infrastructure shared by the Courier crates.
//!
//! Provides builders for webhooks and events with sensible defaults, an HTTP
//! receiver double that records the signed callbacks it receives, and
//! isolated PostgreSQL databases for storage tests.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod database;
pub mod fixtures;
pub mod http;

pub use courier_core::TestClock;
pub use database::TestDatabase;
pub use fixtures::{EventBuilder, WebhookBuilder};
pub use http::{MockResponse, MockServer, RecordedRequest};
