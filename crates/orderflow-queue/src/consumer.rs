//! Order batch consumer
//!
//! Receives batches one delivery at a time and settles each delivery exactly
//! once:
//!
//! | Outcome | Settlement |
//! |---------|------------|
//! | every record handled | ack |
//! | handler error, attempts left | requeue |
//! | handler error on the last allowed attempt | dead-letter, then reject |
//! | undecodable body or invalid record | dead-letter, then reject |
//!
//! Broker errors end [`OrderConsumer::run`]. The delivery being processed at
//! that point stays unacknowledged and is redelivered.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use orderflow_common::config::BrokerConfig;
use orderflow_common::{OrderBatch, OrderRecord, Result};

use crate::broker::{Delivery, MessageBroker, OutboundMessage, QueueSpec, SubscribeOptions};

/// Per-record processing step
#[async_trait]
pub trait OrderHandler: Send + Sync {
    async fn handle(&self, order: &OrderRecord) -> anyhow::Result<()>;
}

/// Logs each order. The consumer keeps no state of its own.
pub struct LoggingOrderHandler;

#[async_trait]
impl OrderHandler for LoggingOrderHandler {
    async fn handle(&self, order: &OrderRecord) -> anyhow::Result<()> {
        info!(
            order_id = order.id,
            item = %order.item,
            qty = order.qty,
            price_usd = %order.price_source,
            "Received order"
        );
        Ok(())
    }
}

/// Counters for one [`OrderConsumer::run`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Acked,
    Requeued,
    DeadLettered,
}

impl ConsumerStats {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Acked => self.acked += 1,
            Outcome::Requeued => self.requeued += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

pub struct OrderConsumer {
    broker: Arc<dyn MessageBroker>,
    handler: Arc<dyn OrderHandler>,
    queue: QueueSpec,
    dead_letter: QueueSpec,
    options: SubscribeOptions,
    max_deliveries: u32,
    consumer_id: Uuid,
    hostname: String,
}

impl OrderConsumer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        handler: Arc<dyn OrderHandler>,
        config: &BrokerConfig,
    ) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            broker,
            handler,
            queue: QueueSpec::durable(config.queue_name.clone()),
            dead_letter: QueueSpec::durable(config.dead_letter_queue.clone()),
            options: SubscribeOptions {
                consumer_name: format!("{}-workers", config.queue_name),
                prefetch: config.prefetch,
            },
            max_deliveries: config.max_deliveries,
            consumer_id: Uuid::new_v4(),
            hostname,
        }
    }

    pub fn consumer_id(&self) -> Uuid {
        self.consumer_id
    }

    /// Consume until `shutdown` is cancelled or the broker fails.
    ///
    /// A delivery received before cancellation is processed and settled
    /// before this returns.
    #[instrument(
        skip_all,
        fields(consumer_id = %self.consumer_id, host = %self.hostname, queue = %self.queue.name)
    )]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<ConsumerStats> {
        self.broker.declare_queue(&self.dead_letter).await?;
        let mut subscription = self.broker.subscribe(&self.queue, &self.options).await?;

        info!(
            dead_letter = %self.dead_letter.name,
            prefetch = self.options.prefetch,
            max_deliveries = self.max_deliveries,
            "Consumer started"
        );

        let mut stats = ConsumerStats::default();
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer waiting for deliveries");
                    break;
                }
                delivery = subscription.next_delivery() => delivery?,
            };

            stats.received += 1;
            let outcome = self.process(delivery).await?;
            stats.record(outcome);
        }

        drop(subscription);
        info!(
            received = stats.received,
            acked = stats.acked,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Consumer stopped"
        );
        Ok(stats)
    }

    async fn process(&self, delivery: Delivery) -> Result<Outcome> {
        let attempt = delivery.attempt();

        let decoded = decode(&delivery);
        let batch = match decoded {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, attempt, "Malformed message, dead-lettering");
                self.dead_letter(delivery).await?;
                return Ok(Outcome::DeadLettered);
            }
        };

        match self.handle_batch(&batch).await {
            Ok(()) => {
                delivery.ack().await?;
                debug!(orders = batch.len(), attempt, "Acknowledged batch");
                Ok(Outcome::Acked)
            }
            Err(e) if attempt >= self.max_deliveries => {
                error!(
                    error = %format!("{:#}", e),
                    attempt,
                    "Batch failed on final attempt, dead-lettering"
                );
                self.dead_letter(delivery).await?;
                Ok(Outcome::DeadLettered)
            }
            Err(e) => {
                warn!(error = %format!("{:#}", e), attempt, "Batch failed, requeueing");
                delivery.requeue().await?;
                Ok(Outcome::Requeued)
            }
        }
    }

    async fn handle_batch(&self, batch: &OrderBatch) -> anyhow::Result<()> {
        for order in &batch.orders {
            self.handler
                .handle(order)
                .await
                .with_context(|| format!("handling order {}", order.id))?;
        }
        Ok(())
    }

    /// Copy the body to the dead-letter queue, then drop the original.
    /// If the copy fails the original stays unacknowledged.
    async fn dead_letter(&self, delivery: Delivery) -> Result<()> {
        let body = delivery.body().clone();
        self.broker
            .publish(&self.dead_letter.name, OutboundMessage::persistent(body))
            .await?;
        delivery.reject().await
    }
}

fn decode(delivery: &Delivery) -> Result<OrderBatch> {
    let batch = OrderBatch::from_json_bytes(delivery.body())?;
    batch.validate()?;
    Ok(batch)
}
