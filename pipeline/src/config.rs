//! Pipeline configuration.
//!
//! Loads configuration from `PIPELINE_*` environment variables with sensible
//! defaults. A `.env` file, when present, fills in variables the process
//! environment does not set. Unparseable values fall back to the default;
//! [`PipelineConfig::validate`] rejects combinations the pipeline cannot run with.

use orderflow_runtime::{ChangeStreamConfig, QueueConfig, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A setting is out of range.
    #[error("invalid {key}: {reason}")]
    Invalid {
        /// Setting name
        key: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// A `.env` file exists but could not be read.
    #[error("failed to read env file {path}: {reason}")]
    EnvFile {
        /// File that failed
        path: String,
        /// Parser or I/O error
        reason: String,
    },
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Simulated payment gateway
    pub payment: PaymentConfig,
    /// Shared queue settings
    pub queues: QueueSettings,
    /// Per-consumer worker settings
    pub consumers: ConsumersConfig,
    /// Fraud scoring
    pub fraud: FraudConfig,
    /// Email rendering
    pub email: EmailConfig,
    /// Order change stream
    pub stream: StreamSettings,
    /// Metrics and demo settings
    pub server: ServerConfig,
}

/// Payment gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    /// Simulated gateway latency in milliseconds
    pub latency_ms: u64,
    /// Timeout around the gateway call in milliseconds
    pub timeout_ms: u64,
    /// Probability in `[0, 1]` that a charge is declined
    pub decline_rate: f64,
    /// Seed for reproducible declines
    pub seed: Option<u64>,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            latency_ms: 100,
            timeout_ms: 5_000,
            decline_rate: 0.1,
            seed: None,
        }
    }
}

impl PaymentConfig {
    /// Gateway latency.
    #[must_use]
    pub const fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    /// Payment timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Queue configuration shared by every consumer queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum messages per queue
    pub capacity: usize,
    /// Deliveries before a message is dead-lettered
    pub max_delivery_count: u32,
    /// Depth above which a queue reports unhealthy
    pub depth_alert: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_delivery_count: 3,
            depth_alert: 1_000,
        }
    }
}

impl QueueSettings {
    /// Runtime queue configuration.
    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::default()
            .with_max_delivery_count(self.max_delivery_count)
            .with_capacity(self.capacity)
    }
}

/// Worker settings for one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSettings {
    /// Messages per dequeue
    pub batch_size: usize,
    /// Visibility timeout in seconds
    pub visibility_timeout_secs: u64,
    /// Handler budget in seconds
    pub processing_timeout_secs: u64,
}

impl ConsumerSettings {
    const fn new(
        batch_size: usize,
        visibility_timeout_secs: u64,
        processing_timeout_secs: u64,
    ) -> Self {
        Self {
            batch_size,
            visibility_timeout_secs,
            processing_timeout_secs,
        }
    }

    /// Runtime worker configuration.
    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: self.batch_size,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            processing_timeout: Duration::from_secs(self.processing_timeout_secs),
            ..WorkerConfig::default()
        }
    }

    fn validate(&self, key: &'static str) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key,
                reason: "batch size must be positive".to_string(),
            });
        }
        if self.processing_timeout_secs >= self.visibility_timeout_secs {
            return Err(ConfigError::Invalid {
                key,
                reason: format!(
                    "processing timeout ({}s) must be shorter than the visibility timeout ({}s)",
                    self.processing_timeout_secs, self.visibility_timeout_secs
                ),
            });
        }
        Ok(())
    }
}

/// Worker settings per consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumersConfig {
    /// Inventory worker
    pub inventory: ConsumerSettings,
    /// Email worker
    pub email: ConsumerSettings,
    /// Analytics worker
    pub analytics: ConsumerSettings,
    /// Fraud worker (one message at a time, longer budget)
    pub fraud: ConsumerSettings,
}

impl Default for ConsumersConfig {
    fn default() -> Self {
        Self {
            inventory: ConsumerSettings::new(10, 30, 25),
            email: ConsumerSettings::new(10, 30, 25),
            analytics: ConsumerSettings::new(10, 30, 25),
            fraud: ConsumerSettings::new(1, 60, 55),
        }
    }
}

/// Fraud scoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FraudConfig {
    /// Scores at or above this are held for review
    pub threshold: f64,
    /// Maximum random score adjustment
    pub jitter: f64,
    /// Simulated inference time in milliseconds
    pub inference_delay_ms: u64,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            jitter: 0.1,
            inference_delay_ms: 100,
        }
    }
}

/// Email configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// Sender address
    pub from: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from: crate::consumers::email::DEFAULT_FROM_EMAIL.to_string(),
        }
    }
}

/// Change stream configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Records per read
    pub batch_size: usize,
    /// Poll interval in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 100,
        }
    }
}

impl StreamSettings {
    /// Runtime change-stream configuration.
    #[must_use]
    pub const fn stream_config(&self) -> ChangeStreamConfig {
        ChangeStreamConfig {
            batch_size: self.batch_size,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

/// Metrics and demo configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Metrics scrape address
    pub metrics_addr: String,
    /// Orders submitted by the demo binary
    pub demo_orders: usize,
    /// Seconds to wait for queues to drain on shutdown
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            metrics_addr: "0.0.0.0:9090".to_string(),
            demo_orders: 50,
            drain_timeout_secs: 30,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn consumer_from(
    lookup: &impl Fn(&str) -> Option<String>,
    prefix: &str,
    default: ConsumerSettings,
) -> ConsumerSettings {
    ConsumerSettings {
        batch_size: parsed(lookup, &format!("PIPELINE_{prefix}_BATCH_SIZE"), default.batch_size),
        visibility_timeout_secs: parsed(
            lookup,
            &format!("PIPELINE_{prefix}_VISIBILITY_TIMEOUT_SECS"),
            default.visibility_timeout_secs,
        ),
        processing_timeout_secs: parsed(
            lookup,
            &format!("PIPELINE_{prefix}_PROCESSING_TIMEOUT_SECS"),
            default.processing_timeout_secs,
        ),
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load `.env` from the working directory (if any), then the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvFile`] if a `.env` file exists but is malformed.
    pub fn load() -> Result<Self, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!(path = %path.display(), "Loaded env file"),
            Err(e) if e.not_found() => {}
            Err(e) => {
                return Err(ConfigError::EnvFile {
                    path: ".env".to_string(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(Self::from_env())
    }

    /// Load from an env file; variables set in the process environment win.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EnvFile`] if the file is missing or malformed.
    pub fn from_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let env_file_error = |e: dotenvy::Error| ConfigError::EnvFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        };
        let file = dotenvy::from_path_iter(path)
            .map_err(env_file_error)?
            .collect::<Result<HashMap<String, String>, _>>()
            .map_err(env_file_error)?;
        Ok(Self::from_lookup(|key| {
            env::var(key).ok().or_else(|| file.get(key).cloned())
        }))
    }

    /// Load configuration from any key-value source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let consumers = &defaults.consumers;
        Self {
            payment: PaymentConfig {
                latency_ms: parsed(
                    &lookup,
                    "PIPELINE_PAYMENT_LATENCY_MS",
                    defaults.payment.latency_ms,
                ),
                timeout_ms: parsed(
                    &lookup,
                    "PIPELINE_PAYMENT_TIMEOUT_MS",
                    defaults.payment.timeout_ms,
                ),
                decline_rate: parsed(
                    &lookup,
                    "PIPELINE_PAYMENT_DECLINE_RATE",
                    defaults.payment.decline_rate,
                ),
                seed: lookup("PIPELINE_PAYMENT_SEED").and_then(|s| s.parse().ok()),
            },
            queues: QueueSettings {
                capacity: parsed(&lookup, "PIPELINE_QUEUE_CAPACITY", defaults.queues.capacity),
                max_delivery_count: parsed(
                    &lookup,
                    "PIPELINE_MAX_DELIVERY_COUNT",
                    defaults.queues.max_delivery_count,
                ),
                depth_alert: parsed(
                    &lookup,
                    "PIPELINE_QUEUE_DEPTH_ALERT",
                    defaults.queues.depth_alert,
                ),
            },
            consumers: ConsumersConfig {
                inventory: consumer_from(&lookup, "INVENTORY", consumers.inventory),
                email: consumer_from(&lookup, "EMAIL", consumers.email),
                analytics: consumer_from(&lookup, "ANALYTICS", consumers.analytics),
                fraud: consumer_from(&lookup, "FRAUD", consumers.fraud),
            },
            fraud: FraudConfig {
                threshold: parsed(&lookup, "PIPELINE_FRAUD_THRESHOLD", defaults.fraud.threshold),
                jitter: parsed(&lookup, "PIPELINE_FRAUD_JITTER", defaults.fraud.jitter),
                inference_delay_ms: parsed(
                    &lookup,
                    "PIPELINE_FRAUD_INFERENCE_DELAY_MS",
                    defaults.fraud.inference_delay_ms,
                ),
            },
            email: EmailConfig {
                from: lookup("PIPELINE_EMAIL_FROM").unwrap_or(defaults.email.from),
            },
            stream: StreamSettings {
                batch_size: parsed(
                    &lookup,
                    "PIPELINE_STREAM_BATCH_SIZE",
                    defaults.stream.batch_size,
                ),
                poll_interval_ms: parsed(
                    &lookup,
                    "PIPELINE_STREAM_POLL_INTERVAL_MS",
                    defaults.stream.poll_interval_ms,
                ),
            },
            server: ServerConfig {
                metrics_addr: lookup("PIPELINE_METRICS_ADDR")
                    .unwrap_or(defaults.server.metrics_addr),
                demo_orders: parsed(&lookup, "PIPELINE_DEMO_ORDERS", defaults.server.demo_orders),
                drain_timeout_secs: parsed(
                    &lookup,
                    "PIPELINE_DRAIN_TIMEOUT_SECS",
                    defaults.server.drain_timeout_secs,
                ),
            },
        }
    }

    /// Check that the settings can run together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.payment.decline_rate) {
            return Err(ConfigError::Invalid {
                key: "payment.decline_rate",
                reason: format!("{} is outside [0, 1]", self.payment.decline_rate),
            });
        }
        if self.payment.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "payment.timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.queues.capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "queues.capacity",
                reason: "must be positive".to_string(),
            });
        }
        if self.queues.max_delivery_count == 0 {
            return Err(ConfigError::Invalid {
                key: "queues.max_delivery_count",
                reason: "must be at least 1".to_string(),
            });
        }
        self.consumers.inventory.validate("consumers.inventory")?;
        self.consumers.email.validate("consumers.email")?;
        self.consumers.analytics.validate("consumers.analytics")?;
        self.consumers.fraud.validate("consumers.fraud")?;
        if !(0.0..=1.0).contains(&self.fraud.threshold) {
            return Err(ConfigError::Invalid {
                key: "fraud.threshold",
                reason: format!("{} is outside [0, 1]", self.fraud.threshold),
            });
        }
        if self.fraud.jitter < 0.0 {
            return Err(ConfigError::Invalid {
                key: "fraud.jitter",
                reason: "must not be negative".to_string(),
            });
        }
        if self.email.from.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "email.from",
                reason: "sender address is empty".to_string(),
            });
        }
        if self.stream.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "stream.batch_size",
                reason: "must be positive".to_string(),
            });
        }
        self.metrics_addr()?;
        Ok(())
    }

    /// Parsed metrics address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the address does not parse.
    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .metrics_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                key: "server.metrics_addr",
                reason: e.to_string(),
            })
    }
}
