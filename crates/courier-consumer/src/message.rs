//! Inbound log messages and their conversion into events.
//!
//! A producer writes `{type, account_id, campaign_id?, data}` as the message
//! value and `message_id`, `produced_at` and `producer` as headers. Anything
//! that does not fit is a message-shape error and goes to the dead-letter
//! destination.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use courier_core::{AccountId, CampaignId, Event, EventId};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{
    error::{ConsumerError, Result},
    offsets::TopicPartition,
};

/// Header carrying the producer's message id.
pub const MESSAGE_ID_HEADER: &str = "message_id";

/// Header carrying the producer's RFC 3339 timestamp.
pub const PRODUCED_AT_HEADER: &str = "produced_at";

/// Header naming the producing service.
pub const PRODUCER_HEADER: &str = "producer";

/// A message read from the event log, as fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// Source topic.
    pub topic: String,
    /// Source partition.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Message key.
    pub key: Option<String>,
    /// Raw message value.
    pub value: Vec<u8>,
    /// Message headers.
    pub headers: BTreeMap<String, String>,
    /// Log append time.
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogMessage {
    /// Creates a message without key, headers or timestamp.
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value,
            headers: BTreeMap::new(),
            timestamp: None,
        }
    }

    /// Sets the message key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the log append time.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Returns the topic and partition the message came from.
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(&self.topic, self.partition)
    }
}

/// Wire shape of a message value.
#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(rename = "type")]
    event_type: Option<String>,
    account_id: Option<String>,
    #[serde(default)]
    campaign_id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Parses a log message into an event.
///
/// The event id comes from the `message_id` header when it is a UUID. The
/// production time comes from the `produced_at` header, then the log
/// timestamp, then `now`.
///
/// # Errors
///
/// Returns `ConsumerError::MalformedMessage` if the value is not a JSON
/// object of the expected shape or an identifier does not parse.
pub fn parse_event(message: &LogMessage, now: DateTime<Utc>) -> Result<Event> {
    let body: EventMessage = serde_json::from_slice(&message.value)
        .map_err(|e| ConsumerError::malformed(format!("invalid message value: {e}")))?;

    let event_type = body
        .event_type
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ConsumerError::malformed("missing event type"))?;

    let account_id = body
        .account_id
        .ok_or_else(|| ConsumerError::malformed("missing account_id"))?
        .parse::<AccountId>()
        .map_err(|e| ConsumerError::malformed(format!("invalid account_id: {e}")))?;

    let campaign_id = body
        .campaign_id
        .map(|raw| raw.parse::<CampaignId>())
        .transpose()
        .map_err(|e| ConsumerError::malformed(format!("invalid campaign_id: {e}")))?;

    let data = match body.data {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(data @ Value::Object(_)) => data,
        Some(_) => return Err(ConsumerError::malformed("data must be a JSON object")),
    };

    let id = message
        .headers
        .get(MESSAGE_ID_HEADER)
        .and_then(|raw| raw.parse::<EventId>().ok())
        .unwrap_or_default();

    let produced_at = message
        .headers
        .get(PRODUCED_AT_HEADER)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
        .or(message.timestamp)
        .unwrap_or(now);

    Ok(Event { id, event_type, account_id, campaign_id, data, produced_at })
}
