//! Kafka binding for the event source and the dead-letter destination.
//!
//! Offsets are committed manually with the positions the consumer reports,
//! so auto-commit is disabled. Dead-letter publishes wait for all in-sync
//! replicas.

use std::{collections::BTreeMap, future::Future, pin::Pin, time::Duration};

use chrono::DateTime;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{Headers, Message},
    producer::{FutureProducer, FutureRecord},
    Offset, TopicPartitionList,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    dead_letter::DeadLetterRecord,
    error::{ConsumerError, Result},
    message::LogMessage,
    offsets::TopicPartition,
    source::{DeadLetterSink, EventSource},
};

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,
    /// Consumer group id.
    pub group_id: String,
    /// Topic carrying events.
    pub topic: String,
    /// Topic receiving dead-letter records.
    pub dead_letter_topic: String,
}

/// Event source reading one topic as part of a consumer group.
pub struct KafkaEventSource {
    consumer: StreamConsumer,
}

impl KafkaEventSource {
    /// Connects and subscribes to the event topic.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::Source` if the client cannot be created or
    /// the subscription fails.
    pub fn connect(config: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| ConsumerError::source(format!("failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| ConsumerError::source(format!("failed to subscribe: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.group_id,
            topic = %config.topic,
            "subscribed to event topic"
        );
        Ok(Self { consumer })
    }
}

impl EventSource for KafkaEventSource {
    fn next_message(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LogMessage>>> + Send + '_>> {
        Box::pin(async move {
            let message = self
                .consumer
                .recv()
                .await
                .map_err(|e| ConsumerError::source(format!("receive failed: {e}")))?;

            let mut headers = BTreeMap::new();
            if let Some(borrowed) = message.headers() {
                for header in borrowed.iter() {
                    if let Some(value) = header.value {
                        headers.insert(
                            header.key.to_string(),
                            String::from_utf8_lossy(value).into_owned(),
                        );
                    }
                }
            }

            let timestamp =
                message.timestamp().to_millis().and_then(DateTime::from_timestamp_millis);

            Ok(Some(LogMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                headers,
                timestamp,
            }))
        })
    }

    fn commit(
        &self,
        tp: TopicPartition,
        position: i64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut list = TopicPartitionList::new();
            list.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(position))
                .map_err(|e| ConsumerError::source(format!("invalid commit position: {e}")))?;

            self.consumer
                .commit(&list, CommitMode::Async)
                .map_err(|e| ConsumerError::source(format!("commit failed: {e}")))?;

            debug!(topic_partition = %tp, position, "offset committed");
            Ok(())
        })
    }
}

/// Dead-letter destination publishing to a Kafka topic.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterSink {
    /// Creates a producer for the dead-letter topic.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::DeadLetter` if the producer cannot be created.
    pub fn connect(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| ConsumerError::dead_letter(format!("failed to create producer: {e}")))?;

        Ok(Self { producer, topic: config.dead_letter_topic.clone() })
    }
}

impl DeadLetterSink for KafkaDeadLetterSink {
    fn publish(
        &self,
        record: DeadLetterRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let payload = record
                .to_bytes()
                .map_err(|e| ConsumerError::dead_letter(format!("serialization failed: {e}")))?;

            let mut outgoing = FutureRecord::<str, Vec<u8>>::to(&self.topic).payload(&payload);
            if let Some(key) = record.key() {
                outgoing = outgoing.key(key);
            }

            self.producer
                .send(outgoing, PUBLISH_TIMEOUT)
                .await
                .map_err(|(e, _)| ConsumerError::dead_letter(e.to_string()))?;

            debug!(
                topic = %self.topic,
                original_partition = record.original_partition,
                original_offset = record.original_offset,
                "dead-letter record published"
            );
            Ok(())
        })
    }
}
