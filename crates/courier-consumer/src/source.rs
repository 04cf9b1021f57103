//! Event log and dead-letter abstractions.
//!
//! The consumer only needs to fetch messages in order, commit positions and
//! publish dead-letter records. Production binds these to Kafka (feature
//! `kafka`); tests use the in-memory implementations below.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use tokio::sync::{Notify, RwLock};

use crate::{
    dead_letter::DeadLetterRecord,
    error::{ConsumerError, Result},
    message::LogMessage,
    offsets::TopicPartition,
};

/// Ordered source of log messages.
pub trait EventSource: Send + Sync + 'static {
    /// Waits for the next message. `None` means the source is exhausted.
    fn next_message(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LogMessage>>> + Send + '_>>;

    /// Commits `position`, the offset of the next message to consume.
    fn commit(
        &self,
        tp: TopicPartition,
        position: i64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Durable destination for unprocessable messages.
pub trait DeadLetterSink: Send + Sync + 'static {
    /// Publishes a record and returns once it is acknowledged.
    fn publish(
        &self,
        record: DeadLetterRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// In-memory event source.
///
/// Messages pushed before `close()` are delivered in order; once closed and
/// drained `next_message` returns `None`.
#[derive(Clone, Default)]
pub struct InMemoryEventSource {
    queue: Arc<RwLock<VecDeque<LogMessage>>>,
    commits: Arc<RwLock<HashMap<TopicPartition, i64>>>,
    closed: Arc<RwLock<bool>>,
    fetch_errors: Arc<RwLock<usize>>,
    notify: Arc<Notify>,
}

impl InMemoryEventSource {
    /// Creates an empty, open source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message.
    pub async fn push(&self, message: LogMessage) {
        self.queue.write().await.push_back(message);
        self.notify.notify_waiters();
    }

    /// Marks the source exhausted once the queue drains.
    pub async fn close(&self) {
        *self.closed.write().await = true;
        self.notify.notify_waiters();
    }

    /// Makes the next `times` fetches fail.
    pub async fn inject_fetch_error(&self, times: usize) {
        *self.fetch_errors.write().await = times;
    }

    /// Returns the committed position of a partition.
    pub async fn committed(&self, tp: &TopicPartition) -> Option<i64> {
        self.commits.read().await.get(tp).copied()
    }

    /// Waits until the committed position of `tp` reaches `position`.
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_commit(
        &self,
        tp: &TopicPartition,
        position: i64,
        timeout: Duration,
    ) -> bool {
        let poll = async {
            loop {
                if self.committed(tp).await.is_some_and(|committed| committed >= position) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }
}

impl EventSource for InMemoryEventSource {
    fn next_message(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LogMessage>>> + Send + '_>> {
        Box::pin(async move {
            {
                let mut fetch_errors = self.fetch_errors.write().await;
                if *fetch_errors > 0 {
                    *fetch_errors -= 1;
                    return Err(ConsumerError::source("injected fetch failure"));
                }
            }

            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(message) = self.queue.write().await.pop_front() {
                    return Ok(Some(message));
                }
                if *self.closed.read().await {
                    return Ok(None);
                }

                notified.await;
            }
        })
    }

    fn commit(
        &self,
        tp: TopicPartition,
        position: i64,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut commits = self.commits.write().await;
            let entry = commits.entry(tp).or_insert(position);
            *entry = (*entry).max(position);
            Ok(())
        })
    }
}

/// In-memory dead-letter destination.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    records: Arc<RwLock<Vec<DeadLetterRecord>>>,
    publish_errors: Arc<RwLock<usize>>,
    attempts: Arc<RwLock<usize>>,
}

impl InMemoryDeadLetterSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` publishes fail.
    pub async fn inject_publish_error(&self, times: usize) {
        *self.publish_errors.write().await = times;
    }

    /// Returns the acknowledged records.
    pub async fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.read().await.clone()
    }

    /// Returns how many publishes were attempted, including failed ones.
    pub async fn publish_attempts(&self) -> usize {
        *self.attempts.read().await
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn publish(
        &self,
        record: DeadLetterRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.attempts.write().await += 1;

            let mut publish_errors = self.publish_errors.write().await;
            if *publish_errors > 0 {
                *publish_errors -= 1;
                return Err(ConsumerError::dead_letter("injected publish failure"));
            }

            self.records.write().await.push(record);
            Ok(())
        })
    }
}
