//! Message broker contract
//!
//! A broker holds named FIFO queues with at-least-once delivery and manual
//! acknowledgment. A consumer receives [`Delivery`] values from a
//! [`Subscription`] and settles each one exactly once. Anything left unsettled
//! when the subscription or connection goes away is delivered again.

use async_trait::async_trait;
use bytes::Bytes;
use orderflow_common::Result;

pub mod memory;
pub mod nats;

pub use memory::InMemoryBroker;
pub use self::nats::NatsBroker;

/// Queue declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Survives a broker restart
    pub durable: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }

    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
        }
    }
}

/// Message body and delivery mode for a publish
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub body: Bytes,
    /// Written to stable storage on a durable queue
    pub persistent: bool,
}

impl OutboundMessage {
    pub fn persistent(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            persistent: true,
        }
    }

    pub fn transient(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            persistent: false,
        }
    }
}

/// Consumer-side subscription settings
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Name shared by competing consumer instances
    pub consumer_name: String,
    /// Maximum unacknowledged deliveries held by this instance
    pub prefetch: u16,
}

/// Final outcome for a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; remove from the queue
    Ack,
    /// Not processed; deliver again
    Requeue,
    /// Discard without redelivery
    Reject,
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Create the queue if absent.
    ///
    /// Redeclaring with identical settings is a no-op. Redeclaring with a
    /// different durability fails with `QueueConfigMismatch`.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()>;

    /// Enqueue one message. Returns once the broker has accepted it.
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()>;

    /// Declare the queue and start receiving from it
    async fn subscribe(
        &self,
        spec: &QueueSpec,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery.
    ///
    /// Cancel-safe: dropping the future before it completes loses no message.
    async fn next_delivery(&mut self) -> Result<Delivery>;
}

/// Broker-specific settlement of one delivery
#[async_trait]
pub trait Acknowledger: Send {
    async fn settle(&mut self, settlement: Settlement) -> Result<()>;
}

/// A received message awaiting settlement
pub struct Delivery {
    body: Bytes,
    attempt: u32,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Bytes, attempt: u32, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            attempt,
            acker,
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// 1 on first delivery, incremented on every redelivery
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    /// Settle the delivery, consuming it
    pub async fn settle(mut self, settlement: Settlement) -> Result<()> {
        self.acker.settle(settlement).await
    }

    pub async fn ack(self) -> Result<()> {
        self.settle(Settlement::Ack).await
    }

    pub async fn requeue(self) -> Result<()> {
        self.settle(Settlement::Requeue).await
    }

    pub async fn reject(self) -> Result<()> {
        self.settle(Settlement::Reject).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}
