//! # Orderflow Runtime
//!
//! In-memory runtime for the Orderflow fan-out pipeline.
//!
//! ## Core Components
//!
//! - **[`FanoutEventBus`]**: copies each published event into every matching queue
//! - **[`InMemoryQueue`]**: visibility-timeout queue with dead-lettering
//! - **[`DeadLetterStore`]**: failed messages, with resolve/discard/redrive
//! - **[`ConsumerWorker`]**: drains one queue into one message handler
//! - **[`ChangeStreamProcessor`]**: follows a change feed with a checkpoint
//!
//! ## Example
//!
//! ```ignore
//! use orderflow_runtime::{BusConfig, FanoutEventBus, InMemoryQueue, QueueConfig};
//!
//! let analytics = Arc::new(InMemoryQueue::new("analytics", QueueConfig::default()));
//! let bus = FanoutEventBus::new(
//!     Subscriptions::new().subscribe("analytics", SubscriptionFilter::accept_all(), analytics.clone()),
//!     BusConfig::default(),
//! );
//!
//! bus.publish(&event).await?;
//! ```

/// Fan-out event bus
pub mod bus;

/// Change-stream processor
pub mod change_stream;

/// Dead-letter store
pub mod dead_letter;

/// Component health reports
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// In-memory durable queue
pub mod queue;

/// Retry logic with exponential backoff
pub mod retry;

/// Consumer worker
pub mod worker;

pub use bus::{BusConfig, FanoutEventBus};
pub use change_stream::{ChangeStreamConfig, ChangeStreamProcessor, StreamProgress};
pub use dead_letter::{DeadLetterError, DeadLetterStatus, DeadLetterStore, FailedMessage};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use queue::{InMemoryQueue, QueueConfig};
pub use retry::{IdleBackoff, RetryPolicy};
pub use worker::{ConsumerWorker, PollOutcome, WorkerConfig};
