//! Configuration management for the Courier service.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_consumer::ConsumerConfig;
use courier_delivery::{ClientConfig, DeliveryConfig, SweeperConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";

/// Service configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,

    // Event log
    /// Kafka bootstrap servers.
    ///
    /// Environment variable: `KAFKA_BROKERS`
    #[serde(default = "default_kafka_brokers", alias = "KAFKA_BROKERS")]
    pub kafka_brokers: String,
    /// Consumer group id.
    #[serde(default = "default_kafka_group_id", alias = "KAFKA_GROUP_ID")]
    pub kafka_group_id: String,
    /// Topic carrying events.
    #[serde(default = "default_kafka_topic", alias = "KAFKA_TOPIC")]
    pub kafka_topic: String,
    /// Topic receiving dead-letter records.
    #[serde(default = "default_dead_letter_topic", alias = "DEAD_LETTER_TOPIC")]
    pub dead_letter_topic: String,

    // Consumer
    /// Number of consumer workers.
    #[serde(default = "default_worker_count", alias = "WORKER_COUNT")]
    pub worker_count: usize,
    /// Capacity of the queue between the fetch loop and the workers.
    #[serde(default = "default_queue_capacity", alias = "QUEUE_CAPACITY")]
    pub queue_capacity: usize,
    /// Processing attempts per message before it is dead-lettered.
    #[serde(default = "default_processing_attempts", alias = "MAX_PROCESSING_ATTEMPTS")]
    pub max_processing_attempts: u32,

    // Delivery
    /// HTTP request timeout for webhook delivery in seconds.
    #[serde(default = "default_delivery_timeout", alias = "DELIVERY_TIMEOUT_SECONDS")]
    pub delivery_timeout_seconds: u64,
    /// User agent sent with every delivery.
    #[serde(default = "default_user_agent", alias = "USER_AGENT")]
    pub user_agent: String,
    /// Ceiling on attempts per delivery.
    #[serde(default = "default_max_attempts", alias = "MAX_ATTEMPTS")]
    pub max_attempts: i32,

    // Retry scheduler
    /// Seconds between retry sweeps.
    #[serde(default = "default_sweep_interval", alias = "SWEEP_INTERVAL_SECONDS")]
    pub sweep_interval_seconds: u64,
    /// Maximum deliveries retried per sweep.
    #[serde(default = "default_sweep_batch_size", alias = "SWEEP_BATCH_SIZE")]
    pub sweep_batch_size: usize,

    /// Seconds to wait for in-flight work on shutdown.
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Logging
    /// Log filter.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `courier.toml`, and environment
    /// variable overrides, then validates it.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts to HTTP client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.delivery_timeout_seconds),
            user_agent: self.user_agent.clone(),
            max_redirects: 0,
        }
    }

    /// Converts to dispatcher configuration.
    pub fn to_delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig { max_attempts: self.max_attempts }
    }

    /// Converts to retry scheduler configuration.
    pub fn to_sweeper_config(&self) -> SweeperConfig {
        SweeperConfig {
            interval: Duration::from_secs(self.sweep_interval_seconds),
            batch_size: self.sweep_batch_size,
            max_attempts: self.max_attempts,
        }
    }

    /// Converts to consumer configuration.
    pub fn to_consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            max_processing_attempts: self.max_processing_attempts,
            shutdown_timeout: self.shutdown_timeout(),
            ..ConsumerConfig::default()
        }
    }

    /// Converts to Kafka connection settings.
    #[cfg(feature = "kafka")]
    pub fn to_kafka_config(&self) -> courier_consumer::KafkaConfig {
        courier_consumer::KafkaConfig {
            brokers: self.kafka_brokers.clone(),
            group_id: self.kafka_group_id.clone(),
            topic: self.kafka_topic.clone(),
            dead_letter_topic: self.dead_letter_topic.clone(),
        }
    }

    /// Time to wait for in-flight work on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.rfind('@') {
            let credentials_start = self.database_url.find("://").map_or(0, |pos| pos + 3);
            if let Some(colon_pos) = self.database_url[credentials_start..at_pos].find(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(credentials_start + colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database_max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database_min_connections cannot exceed database_max_connections");
        }

        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than 0");
        }

        if self.max_processing_attempts == 0 {
            anyhow::bail!("max_processing_attempts must be greater than 0");
        }

        if self.delivery_timeout_seconds == 0 {
            anyhow::bail!("delivery_timeout_seconds must be greater than 0");
        }

        if self.sweep_interval_seconds == 0 {
            anyhow::bail!("sweep_interval_seconds must be greater than 0");
        }

        if self.shutdown_timeout_seconds == 0 {
            anyhow::bail!("shutdown_timeout_seconds must be greater than 0");
        }

        if self.sweep_batch_size == 0 {
            anyhow::bail!("sweep_batch_size must be greater than 0");
        }

        if self.max_attempts <= 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            kafka_brokers: default_kafka_brokers(),
            kafka_group_id: default_kafka_group_id(),
            kafka_topic: default_kafka_topic(),
            dead_letter_topic: default_dead_letter_topic(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            max_processing_attempts: default_processing_attempts(),
            delivery_timeout_seconds: default_delivery_timeout(),
            user_agent: default_user_agent(),
            max_attempts: default_max_attempts(),
            sweep_interval_seconds: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch_size(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/courier".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_kafka_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_kafka_group_id() -> String {
    "courier".to_string()
}

fn default_kafka_topic() -> String {
    "events".to_string()
}

fn default_dead_letter_topic() -> String {
    "events.dlq".to_string()
}

fn default_worker_count() -> usize {
    courier_consumer::DEFAULT_WORKER_COUNT
}

fn default_queue_capacity() -> usize {
    courier_consumer::DEFAULT_QUEUE_CAPACITY
}

fn default_processing_attempts() -> u32 {
    3
}

fn default_delivery_timeout() -> u64 {
    courier_delivery::DEFAULT_TIMEOUT_SECONDS
}

fn default_user_agent() -> String {
    "Courier/1.0".to_string()
}

fn default_max_attempts() -> i32 {
    courier_delivery::DEFAULT_MAX_ATTEMPTS
}

fn default_sweep_interval() -> u64 {
    courier_delivery::DEFAULT_SWEEP_INTERVAL.as_secs()
}

fn default_sweep_batch_size() -> usize {
    courier_delivery::DEFAULT_SWEEP_BATCH_SIZE
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,courier=debug".to_string()
}
