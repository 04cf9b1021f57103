//! Dead-letter records.
//!
//! A message that cannot be processed is wrapped with its full provenance and
//! the error, then published keyed by the original key so a replay keeps
//! per-key ordering. Values that are not UTF-8 are carried base64-encoded so
//! they can be replayed byte for byte.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::LogMessage;

/// How `original_value` is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueEncoding {
    /// The value was valid UTF-8 and is stored as is.
    #[default]
    Utf8,
    /// The value is standard base64 of the original bytes.
    Base64,
}

/// Value published to the dead-letter destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Topic the message was read from.
    pub original_topic: String,
    /// Partition the message was read from.
    pub original_partition: i32,
    /// Offset of the message.
    pub original_offset: i64,
    /// Message key.
    pub original_key: Option<String>,
    /// Message value, see `original_value_encoding`.
    pub original_value: String,
    /// Encoding of `original_value`.
    #[serde(default)]
    pub original_value_encoding: ValueEncoding,
    /// Message headers.
    pub original_headers: BTreeMap<String, String>,
    /// Log append time.
    pub original_timestamp: Option<DateTime<Utc>>,
    /// Why processing failed.
    pub error: String,
    /// When processing was given up.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Wraps `message` with the error that stopped it.
    pub fn new(message: &LogMessage, error: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        let (original_value, original_value_encoding) = match std::str::from_utf8(&message.value)
        {
            Ok(text) => (text.to_string(), ValueEncoding::Utf8),
            Err(_) => (BASE64.encode(&message.value), ValueEncoding::Base64),
        };

        Self {
            original_topic: message.topic.clone(),
            original_partition: message.partition,
            original_offset: message.offset,
            original_key: message.key.clone(),
            original_value,
            original_value_encoding,
            original_headers: message.headers.clone(),
            original_timestamp: message.timestamp,
            error: error.into(),
            failed_at,
        }
    }

    /// Key to publish under.
    pub fn key(&self) -> Option<&str> {
        self.original_key.as_deref()
    }

    /// Returns the original message value bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if a base64 value is malformed.
    pub fn original_value_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match self.original_value_encoding {
            ValueEncoding::Utf8 => Ok(self.original_value.clone().into_bytes()),
            ValueEncoding::Base64 => BASE64.decode(&self.original_value),
        }
    }

    /// Serializes the record for publishing.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
