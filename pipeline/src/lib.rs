//! # Orderflow Pipeline
//!
//! The order domain running on the Orderflow runtime:
//!
//! - [`OrderProcessor`]: validates, prices, charges, and persists orders, and
//!   publishes one event per status transition
//! - [`consumers`]: inventory, email, analytics, and fraud handlers, each
//!   idempotent under redelivery
//! - [`OrderChangeHandler`]: reacts to the order store's change feed
//! - [`Pipeline`]: wires the bus, queues, workers, and change stream together
//!
//! ## Example
//!
//! ```ignore
//! let pipeline = Pipeline::new(PipelineConfig::from_env())?;
//! let running = pipeline.start();
//!
//! let result = pipeline
//!     .processor()
//!     .create_order(CreateOrderRequest::new("cust-1", vec![OrderItemRequest::new("prod-001", 2)]))
//!     .await?;
//!
//! pipeline.drain(Duration::from_secs(5)).await?;
//! running.shutdown().await;
//! ```

pub mod catalog;
pub mod config;
pub mod consumers;
pub mod error;
pub mod payment;
pub mod pipeline;
pub mod processor;
pub mod store;
pub mod stream;
pub mod types;

pub use catalog::{Catalog, Product};
pub use config::{ConfigError, PipelineConfig};
pub use error::OrderError;
pub use payment::{PaymentGateway, SimulatedPaymentGateway};
pub use pipeline::{Pipeline, QueueReport, RunningPipeline};
pub use processor::{OrderProcessor, ProcessorConfig};
pub use store::{CheckpointTable, OrderStore};
pub use stream::{OrderChangeHandler, StreamNotification};
pub use types::{
    CreateOrderRequest, CustomerId, LineItem, Money, Order, OrderId, OrderItemRequest, OrderResult,
    OrderStatus,
};
