//! Event consumer with a bounded worker pool.
//!
//! A single fetch loop reads the log in order and pushes messages into a
//! bounded channel; a fixed pool of workers drains it. A full channel blocks
//! the fetch loop, which is the only backpressure. Each message ends either
//! processed or dead-lettered, and only then is its offset eligible for
//! commit. Messages abandoned at shutdown stay uncommitted and are read
//! again after restart.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use courier_core::{Clock, Event};
use courier_delivery::Dispatcher;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    dead_letter::DeadLetterRecord,
    error::{ConsumerError, Result},
    message::{parse_event, LogMessage},
    offsets::OffsetTracker,
    source::{DeadLetterSink, EventSource},
};

/// Handles one parsed event.
pub trait EventProcessor: Send + Sync + 'static {
    /// Processes an event. Errors for which `is_dead_letter()` is false are
    /// retried in place.
    fn process(&self, event: Event) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

impl EventProcessor for Dispatcher {
    fn process(&self, event: Event) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.dispatch(&event).await?;
            Ok(())
        })
    }
}

/// Configuration for the event consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Capacity of the queue between fetch loop and workers.
    pub queue_capacity: usize,
    /// Processing attempts per message before it is dead-lettered.
    pub max_processing_attempts: u32,
    /// Pause between processing attempts and between dead-letter retries.
    pub processing_retry_delay: Duration,
    /// Maximum time to wait for workers on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            queue_capacity: crate::DEFAULT_QUEUE_CAPACITY,
            max_processing_attempts: 3,
            processing_retry_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Statistics for consumer monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages read from the log.
    pub fetched: u64,
    /// Messages processed successfully.
    pub processed: u64,
    /// Messages published to the dead-letter destination.
    pub dead_lettered: u64,
    /// Messages whose offset is eligible for commit.
    pub committed: u64,
    /// Messages currently held by a worker.
    pub in_flight: u64,
    /// Running workers.
    pub active_workers: usize,
}

/// State shared by the fetch loop and every worker.
struct ConsumerContext {
    source: Arc<dyn EventSource>,
    dead_letters: Arc<dyn DeadLetterSink>,
    processor: Arc<dyn EventProcessor>,
    config: ConsumerConfig,
    clock: Arc<dyn Clock>,
    offsets: Mutex<OffsetTracker>,
    stats: RwLock<ConsumerStats>,
    cancellation_token: CancellationToken,
}

/// Consumes the event log and hands events to a processor.
pub struct EventConsumer {
    context: Arc<ConsumerContext>,
    handles: Vec<JoinHandle<()>>,
}

impl EventConsumer {
    /// Creates a consumer. Nothing runs until `start`.
    pub fn new(
        source: Arc<dyn EventSource>,
        dead_letters: Arc<dyn DeadLetterSink>,
        processor: Arc<dyn EventProcessor>,
        config: ConsumerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let context = ConsumerContext {
            source,
            dead_letters,
            processor,
            config,
            clock,
            offsets: Mutex::new(OffsetTracker::new()),
            stats: RwLock::new(ConsumerStats::default()),
            cancellation_token: CancellationToken::new(),
        };
        Self { context: Arc::new(context), handles: Vec::new() }
    }

    /// Spawns the fetch loop and the workers.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::Processing` if the consumer is already
    /// running or the configuration has no workers or no queue.
    pub async fn start(&mut self) -> Result<()> {
        let config = self.context.config;
        if !self.handles.is_empty() {
            return Err(ConsumerError::processing("consumer already started"));
        }
        if config.worker_count == 0 || config.queue_capacity == 0 {
            return Err(ConsumerError::processing(
                "worker count and queue capacity must be greater than zero",
            ));
        }

        info!(
            worker_count = config.worker_count,
            queue_capacity = config.queue_capacity,
            "starting event consumer"
        );

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        self.context.stats.write().await.active_workers = config.worker_count;

        for worker_id in 0..config.worker_count {
            let context = self.context.clone();
            let receiver = receiver.clone();
            self.handles.push(tokio::spawn(async move {
                debug!(worker_id, "consumer worker starting");
                run_worker(worker_id, &context, &receiver).await;
                context.stats.write().await.active_workers -= 1;
                debug!(worker_id, "consumer worker stopped");
            }));
        }

        let context = self.context.clone();
        self.handles.push(tokio::spawn(async move {
            run_fetch_loop(&context, sender).await;
        }));

        info!("event consumer started");
        Ok(())
    }

    /// Returns current consumer statistics.
    pub async fn stats(&self) -> ConsumerStats {
        self.context.stats.read().await.clone()
    }

    /// Returns the token that stops the consumer when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.context.cancellation_token.clone()
    }

    /// Stops fetching, lets in-flight messages finish and joins every task.
    ///
    /// # Errors
    ///
    /// Returns `ConsumerError::ShutdownTimeout` if the tasks do not finish
    /// within `timeout`, or `ConsumerError::WorkerPanic` if one panicked.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            task_count = self.handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful consumer shutdown"
        );

        self.context.cancellation_token.cancel();
        let handles = std::mem::take(&mut self.handles);

        let shutdown_future = async {
            let mut first_panic = None;
            for (task_id, handle) in handles.into_iter().enumerate() {
                if let Err(join_error) = handle.await {
                    error!(
                        task_id,
                        error = %join_error,
                        "consumer task panicked during shutdown"
                    );
                    first_panic.get_or_insert(ConsumerError::WorkerPanic {
                        worker_id: task_id,
                        error: join_error.to_string(),
                    });
                }
            }
            first_panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("event consumer shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "consumer shutdown timed out, some tasks may still be running"
                );
                Err(ConsumerError::ShutdownTimeout { timeout })
            },
        }
    }
}

impl Drop for EventConsumer {
    fn drop(&mut self) {
        let active_count = self.handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.context.cancellation_token.is_cancelled() {
            error!(
                active_tasks = active_count,
                "EventConsumer dropped with active tasks, forcing cancellation"
            );
            self.context.cancellation_token.cancel();
        }
    }
}

async fn run_fetch_loop(context: &ConsumerContext, sender: mpsc::Sender<LogMessage>) {
    let token = &context.cancellation_token;

    loop {
        let fetched = tokio::select! {
            biased;
            () = token.cancelled() => break,
            fetched = context.source.next_message() => fetched,
        };

        let message = match fetched {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!("event source exhausted");
                break;
            },
            Err(e) => {
                error!(error = %e, "failed to fetch message");
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = context.clock.sleep(context.config.processing_retry_delay) => continue,
                }
            },
        };

        context.offsets.lock().await.track(&message.topic_partition(), message.offset);
        context.stats.write().await.fetched += 1;

        let enqueued = tokio::select! {
            biased;
            () = token.cancelled() => break,
            sent = sender.send(message) => sent.is_ok(),
        };
        if !enqueued {
            break;
        }
    }

    debug!("fetch loop stopped");
}

async fn run_worker(
    worker_id: usize,
    context: &ConsumerContext,
    receiver: &Mutex<mpsc::Receiver<LogMessage>>,
) {
    let token = &context.cancellation_token;

    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                message = receiver.recv() => message,
            }
        };
        let Some(message) = next else {
            break;
        };

        context.stats.write().await.in_flight += 1;
        handle_message(worker_id, context, message).await;
        context.stats.write().await.in_flight -= 1;
    }
}

async fn handle_message(worker_id: usize, context: &ConsumerContext, message: LogMessage) {
    let event = match parse_event(&message, context.clock.now()) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                worker_id,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "malformed message"
            );
            dead_letter(worker_id, context, message, &e).await;
            return;
        },
    };

    let max_attempts = context.config.max_processing_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match context.processor.process(event.clone()).await {
            Ok(()) => {
                debug!(
                    worker_id,
                    event_id = %event.id,
                    partition = message.partition,
                    offset = message.offset,
                    "message processed"
                );
                context.stats.write().await.processed += 1;
                commit(context, &message).await;
                return;
            },
            Err(e) => e,
        };

        if error.is_dead_letter() || attempt >= max_attempts {
            error!(
                worker_id,
                event_id = %event.id,
                offset = message.offset,
                attempt,
                error = %error,
                "message processing failed"
            );
            dead_letter(worker_id, context, message, &error).await;
            return;
        }

        warn!(
            worker_id,
            event_id = %event.id,
            offset = message.offset,
            attempt,
            error = %error,
            "message processing failed, retrying"
        );
        if !pause(context).await {
            info!(
                worker_id,
                offset = message.offset,
                "shutdown during retry, message left uncommitted"
            );
            return;
        }
        attempt += 1;
    }
}

/// Publishes a dead-letter record, retrying until acknowledged, then
/// commits the message. Gives up without committing on cancellation.
async fn dead_letter(
    worker_id: usize,
    context: &ConsumerContext,
    message: LogMessage,
    error: &ConsumerError,
) {
    let record = DeadLetterRecord::new(&message, error.to_string(), context.clock.now());

    loop {
        match context.dead_letters.publish(record.clone()).await {
            Ok(()) => break,
            Err(e) => {
                error!(
                    worker_id,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "dead-letter publish failed, retrying"
                );
                if !pause(context).await {
                    info!(
                        worker_id,
                        offset = message.offset,
                        "shutdown before dead-letter publish, message left uncommitted"
                    );
                    return;
                }
            },
        }
    }

    info!(
        worker_id,
        partition = message.partition,
        offset = message.offset,
        "message dead-lettered"
    );
    context.stats.write().await.dead_lettered += 1;
    commit(context, &message).await;
}

async fn commit(context: &ConsumerContext, message: &LogMessage) {
    let tp = message.topic_partition();
    let position = context.offsets.lock().await.complete(&tp, message.offset);
    context.stats.write().await.committed += 1;

    if let Some(position) = position {
        if let Err(e) = context.source.commit(tp.clone(), position).await {
            warn!(topic_partition = %tp, position, error = %e, "offset commit failed");
        }
    }
}

/// Sleeps for the retry delay. Returns false if cancelled first.
async fn pause(context: &ConsumerContext) -> bool {
    tokio::select! {
        biased;
        () = context.cancellation_token.cancelled() => false,
        () = context.clock.sleep(context.config.processing_retry_delay) => true,
    }
}
