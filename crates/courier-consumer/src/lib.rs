//! Event log consumption for the Courier delivery engine.
//!
//! Reads events from a partitioned log, hands them to the dispatcher through
//! a bounded worker pool and commits offsets only once a message is settled.
//!
//! # Architecture
//!
//! - **Fetch loop** - reads messages in log order into a bounded queue
//! - **Workers** - parse, process with in-place retries, dead-letter on
//!   give-up
//! - **Offset tracking** - per-partition low watermark so out-of-order
//!   completion never commits past an unfinished message
//! - **Dead letters** - malformed or repeatedly failing messages are
//!   published with full provenance before their offset commits
//!
//! The log and the dead-letter destination sit behind [`EventSource`] and
//! [`DeadLetterSink`]. The Kafka binding is compiled with the `kafka`
//! feature; in-memory implementations are always available for tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod dead_letter;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod message;
pub mod offsets;
pub mod source;

pub use consumer::{ConsumerConfig, ConsumerStats, EventConsumer, EventProcessor};
pub use dead_letter::{DeadLetterRecord, ValueEncoding};
pub use error::{ConsumerError, Result};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaConfig, KafkaDeadLetterSink, KafkaEventSource};
pub use message::{parse_event, LogMessage};
pub use offsets::{OffsetTracker, TopicPartition};
pub use source::{DeadLetterSink, EventSource, InMemoryDeadLetterSink, InMemoryEventSource};

/// Default number of consumer workers.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Default capacity of the queue between the fetch loop and the workers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
