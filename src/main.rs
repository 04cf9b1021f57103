//! Courier webhook event-delivery service.
//!
//! Main entry point. Consumes events from the log, fans them out as signed
//! webhook deliveries and retries failed deliveries in the background until
//! a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::Storage, Clock, RealClock};
use courier_delivery::{DeliveryClient, PostgresWebhookStore, RetryScheduler, WebhookStore};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log);

    info!("Starting Courier webhook delivery service");
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        worker_count = config.worker_count,
        sweep_interval_seconds = config.sweep_interval_seconds,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    Storage::new(db_pool.clone()).migrate().await.context("Failed to apply database schema")?;
    info!("Database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let store: Arc<dyn WebhookStore> = Arc::new(PostgresWebhookStore::with_clock(
        Arc::new(Storage::new(db_pool.clone())),
        clock.clone(),
    ));
    let client = Arc::new(
        DeliveryClient::with_clock(config.to_client_config(), clock.clone())
            .context("Failed to create delivery client")?,
    );

    let cancellation_token = CancellationToken::new();

    let scheduler = RetryScheduler::new(
        store.clone(),
        client.clone(),
        clock.clone(),
        config.to_sweeper_config(),
    );
    let scheduler_handle = tokio::spawn({
        let token = cancellation_token.clone();
        async move { scheduler.run(token).await }
    });

    #[cfg(feature = "kafka")]
    let consumer = start_consumer(&config, store, client, clock).await?;

    #[cfg(not(feature = "kafka"))]
    warn!("Built without the `kafka` feature, only the retry scheduler is running");

    info!("Courier is ready");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    #[cfg(feature = "kafka")]
    if let Err(e) = consumer.shutdown_graceful(config.shutdown_timeout()).await {
        error!(error = %e, "Event consumer did not shut down cleanly");
    }

    cancellation_token.cancel();
    match tokio::time::timeout(config.shutdown_timeout(), scheduler_handle).await {
        Ok(Ok(())) => info!("Retry scheduler stopped"),
        Ok(Err(e)) => error!(error = %e, "Retry scheduler task failed"),
        Err(_) => warn!("Retry scheduler shutdown grace period expired"),
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Courier shutdown complete");
    Ok(())
}

/// Connects to Kafka and starts the event consumer.
#[cfg(feature = "kafka")]
async fn start_consumer(
    config: &Config,
    store: Arc<dyn WebhookStore>,
    client: Arc<DeliveryClient>,
    clock: Arc<dyn Clock>,
) -> Result<courier_consumer::EventConsumer> {
    use courier_consumer::{EventConsumer, KafkaDeadLetterSink, KafkaEventSource};
    use courier_delivery::Dispatcher;

    let kafka_config = config.to_kafka_config();
    let source = KafkaEventSource::connect(&kafka_config).context("Failed to connect to Kafka")?;
    let dead_letters = KafkaDeadLetterSink::connect(&kafka_config)
        .context("Failed to create dead-letter producer")?;

    let dispatcher = Dispatcher::new(store, client, clock.clone(), config.to_delivery_config());
    let mut consumer = EventConsumer::new(
        Arc::new(source),
        Arc::new(dead_letters),
        Arc::new(dispatcher),
        config.to_consumer_config(),
        clock,
    );
    consumer.start().await.context("Failed to start event consumer")?;

    info!(
        topic = %kafka_config.topic,
        dead_letter_topic = %kafka_config.dead_letter_topic,
        "Event consumer started"
    );
    Ok(consumer)
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                Storage::new(pool.clone())
                    .health_check()
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
