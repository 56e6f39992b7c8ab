//! Orderflow Queue Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Reliable hand-off of order batches through a durable work queue.
//!
//! # Overview
//!
//! - **Broker**: the [`broker::MessageBroker`] contract with a NATS JetStream
//!   backend and an in-process backend
//! - **Producer**: [`producer::OrderProducer`] fetches the current batch from
//!   the order source and publishes it as one persistent message
//! - **Consumer**: [`consumer::OrderConsumer`] drains the queue with bounded
//!   in-flight capacity and acknowledges only after successful processing
//!
//! Delivery is at-least-once. A message that is not acknowledged (consumer
//! crash, handler failure, lost connection) is delivered again, possibly to a
//! different consumer instance.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use orderflow_common::{config::Config, source::HttpOrderSource};
//! use orderflow_queue::{broker::NatsBroker, producer::OrderProducer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let broker = NatsBroker::connect(&config.broker).await?;
//!     let source = HttpOrderSource::new(&config.source)?;
//!
//!     let producer = OrderProducer::new(
//!         Arc::new(source),
//!         Arc::new(broker),
//!         config.broker.queue_name.clone(),
//!     );
//!     producer.publish_batch().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod consumer;
pub mod producer;

pub use broker::{Delivery, MessageBroker, QueueSpec, Settlement};
pub use consumer::{ConsumerStats, OrderConsumer, OrderHandler};
pub use producer::OrderProducer;
