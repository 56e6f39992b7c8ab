//! NATS JetStream broker
//!
//! Each queue is a JetStream stream of the same name with a single subject
//! (also the queue name) and work-queue retention, so a message is removed
//! once acknowledged. Durable queues use file storage. All consumer
//! instances bind the same durable pull consumer and compete for messages;
//! each subscription holds at most `prefetch` unsettled messages.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy},
    context::{PublishError, PublishErrorKind},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, instrument, warn};

use orderflow_common::config::BrokerConfig;
use orderflow_common::{OrderflowError, Result};

use super::{
    Acknowledger, Delivery, MessageBroker, OutboundMessage, QueueSpec, Settlement,
    SubscribeOptions, Subscription,
};

pub struct NatsBroker {
    jetstream: jetstream::Context,
    ack_wait: Duration,
    fetch_wait: Duration,
}

impl NatsBroker {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let url = config.url();
        info!(url = %url, timeout_secs = config.connect_timeout_secs, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(config.connect_timeout())
            .connect(&url)
            .await
            .map_err(|e| OrderflowError::connection_lost(format!("connect to {}: {}", url, e)))?;

        info!("Connected to NATS");
        Ok(Self {
            jetstream: jetstream::new(client),
            ack_wait: config.ack_wait(),
            fetch_wait: config.fetch_wait(),
        })
    }

    /// Get the stream backing `spec`, creating it if absent
    async fn ensure_stream(&self, spec: &QueueSpec) -> Result<jetstream::stream::Stream> {
        match self.jetstream.get_stream(&spec.name).await {
            Ok(stream) => {
                check_compatible(spec, &stream.cached_info().config)?;
                debug!("Stream already exists");
                Ok(stream)
            }
            Err(_) => {
                let stream = self
                    .jetstream
                    .create_stream(stream_config(spec))
                    .await
                    .map_err(|e| {
                        OrderflowError::connection_lost(format!(
                            "create stream '{}': {}",
                            spec.name, e
                        ))
                    })?;
                info!("Created stream");
                Ok(stream)
            }
        }
    }

    /// Remove a queue and everything in it
    pub async fn delete_queue(&self, name: &str) -> Result<()> {
        self.jetstream
            .delete_stream(name)
            .await
            .map_err(|e| OrderflowError::connection_lost(format!("delete stream '{}': {}", name, e)))?;
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for NatsBroker {
    #[instrument(skip(self), fields(queue = %spec.name, durable = spec.durable))]
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.ensure_stream(spec).await.map(|_| ())
    }

    /// Publish and wait for the server's publish acknowledgment.
    ///
    /// Storage is a property of the stream, so `persistent` has no per-message
    /// effect here.
    #[instrument(skip(self, message), fields(queue = %queue, bytes = message.body.len()))]
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        let ack = self
            .jetstream
            .publish(queue.to_string(), message.body)
            .await
            .map_err(|e| publish_error(queue, e))?;

        let ack = ack.await.map_err(|e| publish_error(queue, e))?;
        debug!(stream = %ack.stream, sequence = ack.sequence, "Publish confirmed");
        Ok(())
    }

    async fn subscribe(
        &self,
        spec: &QueueSpec,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        let stream = self.ensure_stream(spec).await?;

        let consumer = stream
            .get_or_create_consumer(
                &options.consumer_name,
                pull::Config {
                    durable_name: Some(options.consumer_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                OrderflowError::connection_lost(format!(
                    "create consumer '{}': {}",
                    options.consumer_name, e
                ))
            })?;

        info!(
            queue = %spec.name,
            consumer = %options.consumer_name,
            prefetch = options.prefetch,
            "Subscribed to stream"
        );

        let prefetch = usize::from(options.prefetch.max(1));
        Ok(Box::new(NatsSubscription {
            consumer,
            batch: None,
            in_flight: Arc::new(Semaphore::new(prefetch)),
            fetch_wait: self.fetch_wait,
        }))
    }
}

struct NatsSubscription {
    consumer: jetstream::consumer::PullConsumer,
    /// Current pull request; a new one is issued only after it is drained
    batch: Option<pull::Batch>,
    /// One permit per unsettled delivery, released when the delivery is
    /// settled or dropped
    in_flight: Arc<Semaphore>,
    fetch_wait: Duration,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next_delivery(&mut self) -> Result<Delivery> {
        let permit = self
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| OrderflowError::connection_lost(format!("subscription closed: {}", e)))?;

        loop {
            if self.batch.is_none() {
                // Never pull more than the free in-flight slots, counting ours
                let free = self.in_flight.available_permits() + 1;
                let batch = self
                    .consumer
                    .fetch()
                    .max_messages(free)
                    .expires(self.fetch_wait)
                    .messages()
                    .await
                    .map_err(|e| OrderflowError::connection_lost(format!("fetch: {}", e)))?;
                self.batch = Some(batch);
            }

            let Some(batch) = self.batch.as_mut() else {
                continue;
            };

            match batch.next().await {
                Some(Ok(message)) => {
                    let attempt = delivery_attempt(&message);
                    return Ok(Delivery::new(
                        message.payload.clone(),
                        attempt,
                        Box::new(NatsAcker {
                            message,
                            _permit: permit,
                        }),
                    ));
                }
                Some(Err(e)) => {
                    self.batch = None;
                    return Err(OrderflowError::connection_lost(format!("receive: {}", e)));
                }
                // Pull expired or fully delivered
                None => self.batch = None,
            }
        }
    }
}

struct NatsAcker {
    message: jetstream::Message,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acknowledger for NatsAcker {
    async fn settle(&mut self, settlement: Settlement) -> Result<()> {
        let result = match settlement {
            Settlement::Ack => self.message.ack().await,
            Settlement::Requeue => self.message.ack_with(AckKind::Nak(None)).await,
            Settlement::Reject => self.message.ack_with(AckKind::Term).await,
        };
        result.map_err(|e| OrderflowError::connection_lost(format!("settle {:?}: {}", settlement, e)))
    }
}

fn delivery_attempt(message: &jetstream::Message) -> u32 {
    match message.info() {
        Ok(info) => u32::try_from(info.delivered.max(1)).unwrap_or(u32::MAX),
        Err(e) => {
            warn!(error = %e, "Message has no JetStream metadata, assuming first delivery");
            1
        }
    }
}

fn stream_config(spec: &QueueSpec) -> StreamConfig {
    StreamConfig {
        name: spec.name.clone(),
        subjects: vec![spec.name.clone()],
        description: Some(format!("orderflow work queue '{}'", spec.name)),
        retention: RetentionPolicy::WorkQueue,
        storage: storage_for(spec),
        ..Default::default()
    }
}

fn storage_for(spec: &QueueSpec) -> StorageType {
    if spec.durable {
        StorageType::File
    } else {
        StorageType::Memory
    }
}

fn check_compatible(spec: &QueueSpec, existing: &StreamConfig) -> Result<()> {
    let wanted = storage_for(spec);
    if existing.storage != wanted {
        return Err(OrderflowError::queue_mismatch(
            &spec.name,
            format!(
                "declared {:?} storage but stream uses {:?}",
                wanted, existing.storage
            ),
        ));
    }

    if existing.retention != RetentionPolicy::WorkQueue {
        return Err(OrderflowError::queue_mismatch(
            &spec.name,
            format!("stream uses {:?} retention", existing.retention),
        ));
    }

    if !existing.subjects.iter().any(|s| s == &spec.name) {
        return Err(OrderflowError::queue_mismatch(
            &spec.name,
            format!("stream does not bind subject '{}'", spec.name),
        ));
    }

    Ok(())
}

fn publish_error(queue: &str, err: PublishError) -> OrderflowError {
    match err.kind() {
        PublishErrorKind::StreamNotFound => OrderflowError::QueueNotFound(queue.to_string()),
        _ => OrderflowError::connection_lost(format!("publish to '{}': {}", queue, err)),
    }
}
