//! Configuration management
//!
//! One [`Config`] is built at process start and passed by reference to each
//! component. Nothing reads the environment after that.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{OrderflowError, Result};
use crate::types::ExchangeRate;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default order source endpoint.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/orders";

/// Default timeout for a single source request in seconds.
pub const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 5;

/// Default broker host.
pub const DEFAULT_BROKER_HOST: &str = "localhost";

/// Default broker port (NATS client port).
pub const DEFAULT_BROKER_PORT: u16 = 4222;

/// Default broker connection timeout in seconds.
pub const DEFAULT_BROKER_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default work queue name.
pub const DEFAULT_QUEUE_NAME: &str = "orders";

/// Suffix appended to the queue name to form the default dead-letter queue.
pub const DEAD_LETTER_SUFFIX: &str = "_dead_letter";

/// Default in-flight capacity per consumer instance (fair dispatch).
pub const DEFAULT_CONSUMER_PREFETCH: u16 = 1;

/// Default number of delivery attempts before a message is dead-lettered.
pub const DEFAULT_CONSUMER_MAX_DELIVERIES: u32 = 5;

/// Default time the broker waits for an ack before redelivering, in seconds.
pub const DEFAULT_CONSUMER_ACK_WAIT_SECS: u64 = 30;

/// Default long-poll duration for one fetch, in seconds.
pub const DEFAULT_CONSUMER_FETCH_WAIT_SECS: u64 = 5;

/// Default SQLite database path.
pub const DEFAULT_DB_PATH: &str = "orders.db";

/// Default maximum store connections in the pool.
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

/// Default store connection timeout in seconds.
pub const DEFAULT_DB_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    pub etl: EtlConfig,
}

/// Order source client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    pub timeout_secs: u64,
}

/// Broker connection, queue and consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub queue_name: String,
    pub dead_letter_queue: String,
    pub prefetch: u16,
    pub max_deliveries: u32,
    pub ack_wait_secs: u64,
    pub fetch_wait_secs: u64,
}

/// Relational store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// ETL transform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlConfig {
    pub exchange_rate: ExchangeRate,
}

impl SourceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl BrokerConfig {
    /// Connection URL for the broker client
    pub fn url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    pub fn fetch_wait(&self) -> Duration {
        Duration::from_secs(self.fetch_wait_secs)
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Build configuration from an arbitrary key lookup.
    ///
    /// Unset keys fall back to defaults; set but unparsable values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let queue_name = lookup("QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());
        let dead_letter_queue = lookup("DEAD_LETTER_QUEUE")
            .unwrap_or_else(|| format!("{}{}", queue_name, DEAD_LETTER_SUFFIX));

        let exchange_rate = match lookup("USD_TO_EUR") {
            Some(raw) => raw.parse()?,
            None => ExchangeRate::default(),
        };

        Ok(Config {
            source: SourceConfig {
                url: lookup("API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
                timeout_secs: parse_or(&lookup, "SOURCE_TIMEOUT_SECS", DEFAULT_SOURCE_TIMEOUT_SECS)?,
            },
            broker: BrokerConfig {
                host: lookup("BROKER_HOST").unwrap_or_else(|| DEFAULT_BROKER_HOST.to_string()),
                port: parse_or(&lookup, "BROKER_PORT", DEFAULT_BROKER_PORT)?,
                connect_timeout_secs: parse_or(
                    &lookup,
                    "BROKER_CONNECT_TIMEOUT_SECS",
                    DEFAULT_BROKER_CONNECT_TIMEOUT_SECS,
                )?,
                queue_name,
                dead_letter_queue,
                prefetch: parse_or(&lookup, "CONSUMER_PREFETCH", DEFAULT_CONSUMER_PREFETCH)?,
                max_deliveries: parse_or(
                    &lookup,
                    "CONSUMER_MAX_DELIVERIES",
                    DEFAULT_CONSUMER_MAX_DELIVERIES,
                )?,
                ack_wait_secs: parse_or(
                    &lookup,
                    "CONSUMER_ACK_WAIT_SECS",
                    DEFAULT_CONSUMER_ACK_WAIT_SECS,
                )?,
                fetch_wait_secs: parse_or(
                    &lookup,
                    "CONSUMER_FETCH_WAIT_SECS",
                    DEFAULT_CONSUMER_FETCH_WAIT_SECS,
                )?,
            },
            store: StoreConfig {
                path: lookup("DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
                max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
                connect_timeout_secs: parse_or(
                    &lookup,
                    "DB_CONNECT_TIMEOUT_SECS",
                    DEFAULT_DB_CONNECT_TIMEOUT_SECS,
                )?,
            },
            etl: EtlConfig { exchange_rate },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.source.url.trim().is_empty() {
            return Err(OrderflowError::config("API_URL cannot be empty"));
        }

        if self.source.timeout_secs == 0 {
            return Err(OrderflowError::config("Source timeout must be greater than 0"));
        }

        if self.broker.queue_name.trim().is_empty() {
            return Err(OrderflowError::config("Queue name cannot be empty"));
        }

        if self.broker.dead_letter_queue == self.broker.queue_name {
            return Err(OrderflowError::config(format!(
                "Dead-letter queue must differ from the work queue '{}'",
                self.broker.queue_name
            )));
        }

        if self.broker.prefetch == 0 {
            return Err(OrderflowError::config("Consumer prefetch must be greater than 0"));
        }

        if self.broker.max_deliveries == 0 {
            return Err(OrderflowError::config(
                "Consumer max deliveries must be greater than 0",
            ));
        }

        if self.store.max_connections == 0 {
            return Err(OrderflowError::config(
                "Store max_connections must be greater than 0",
            ));
        }

        if self.broker.prefetch > 1 {
            tracing::warn!(
                prefetch = self.broker.prefetch,
                "Consumer prefetch above 1 weakens fair dispatch across instances"
            );
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                url: DEFAULT_API_URL.to_string(),
                timeout_secs: DEFAULT_SOURCE_TIMEOUT_SECS,
            },
            broker: BrokerConfig {
                host: DEFAULT_BROKER_HOST.to_string(),
                port: DEFAULT_BROKER_PORT,
                connect_timeout_secs: DEFAULT_BROKER_CONNECT_TIMEOUT_SECS,
                queue_name: DEFAULT_QUEUE_NAME.to_string(),
                dead_letter_queue: format!("{}{}", DEFAULT_QUEUE_NAME, DEAD_LETTER_SUFFIX),
                prefetch: DEFAULT_CONSUMER_PREFETCH,
                max_deliveries: DEFAULT_CONSUMER_MAX_DELIVERIES,
                ack_wait_secs: DEFAULT_CONSUMER_ACK_WAIT_SECS,
                fetch_wait_secs: DEFAULT_CONSUMER_FETCH_WAIT_SECS,
            },
            store: StoreConfig {
                path: PathBuf::from(DEFAULT_DB_PATH),
                max_connections: DEFAULT_DB_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            },
            etl: EtlConfig {
                exchange_rate: ExchangeRate::default(),
            },
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| OrderflowError::config(format!("invalid value for {}: '{}' ({})", key, raw, e))),
        None => Ok(default),
    }
}
