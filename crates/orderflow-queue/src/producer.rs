//! Order batch producer

use std::sync::Arc;
use tracing::{info, instrument};

use orderflow_common::source::OrderSource;
use orderflow_common::Result;

use crate::broker::{MessageBroker, OutboundMessage, QueueSpec};

/// Publishes the current order batch from the source as one persistent message
pub struct OrderProducer {
    source: Arc<dyn OrderSource>,
    broker: Arc<dyn MessageBroker>,
    queue: QueueSpec,
}

impl OrderProducer {
    pub fn new(
        source: Arc<dyn OrderSource>,
        broker: Arc<dyn MessageBroker>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            source,
            broker,
            queue: QueueSpec::durable(queue_name),
        }
    }

    pub fn queue(&self) -> &QueueSpec {
        &self.queue
    }

    /// Fetch, declare and publish. Returns the number of orders published.
    ///
    /// The source is read before the broker is touched, so a source failure
    /// leaves the queue unchanged. Every call publishes exactly one message,
    /// including for an empty batch.
    #[instrument(skip(self), fields(queue = %self.queue.name))]
    pub async fn publish_batch(&self) -> Result<usize> {
        let batch = self.source.fetch_orders().await?;
        let body = batch.to_json_bytes()?;

        self.broker.declare_queue(&self.queue).await?;
        self.broker
            .publish(&self.queue.name, OutboundMessage::persistent(body))
            .await?;

        info!(orders = batch.len(), "Published order batch");
        Ok(batch.len())
    }
}
