//! In-process broker
//!
//! Same contract as the JetStream backend, held entirely in memory. Used by
//! tests and single-process runs. It models the broker behaviour the rest of
//! the crate relies on:
//!
//! - per-queue FIFO with a ready list and an unacknowledged set
//! - prefetch limits per subscription
//! - requeue of unacknowledged messages when a subscription is dropped
//! - [`InMemoryBroker::restart`] keeps durable queues and persistent messages only
//! - [`InMemoryBroker::disconnect`] fails every subsequent call

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

use orderflow_common::{OrderflowError, Result};

use super::{
    Acknowledger, Delivery, MessageBroker, OutboundMessage, QueueSpec, Settlement,
    SubscribeOptions, Subscription,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Bytes,
    persistent: bool,
    deliveries: u32,
}

#[derive(Debug)]
struct Unacked {
    subscriber: u64,
    message: StoredMessage,
}

#[derive(Debug)]
struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    /// Keyed by delivery tag, so iteration follows delivery order
    unacked: BTreeMap<u64, Unacked>,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
        }
    }

    /// Move unacknowledged messages matching `owned` back to the head of the
    /// queue, oldest delivery first
    fn requeue_unacked(&mut self, owned: impl Fn(&Unacked) -> bool) -> usize {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| owned(u))
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.iter().rev() {
            if let Some(unacked) = self.unacked.remove(tag) {
                self.ready.push_front(unacked.message);
            }
        }
        tags.len()
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    disconnected: bool,
    /// Bumped on restart; handles from an older epoch are dead
    epoch: u64,
    next_tag: u64,
    next_subscriber: u64,
}

impl BrokerState {
    fn ensure_connected(&self, epoch: Option<u64>) -> Result<()> {
        if self.disconnected {
            return Err(OrderflowError::connection_lost("broker is unreachable"));
        }
        match epoch {
            Some(e) if e != self.epoch => Err(OrderflowError::connection_lost(
                "connection was closed by a broker restart",
            )),
            _ => Ok(()),
        }
    }

    fn declare(&mut self, spec: &QueueSpec) -> Result<()> {
        match self.queues.get(&spec.name) {
            Some(existing) if existing.durable != spec.durable => {
                Err(OrderflowError::queue_mismatch(
                    &spec.name,
                    format!(
                        "declared durable={} but existing queue has durable={}",
                        spec.durable, existing.durable
                    ),
                ))
            }
            Some(_) => Ok(()),
            None => {
                debug!(queue = %spec.name, durable = spec.durable, "Declared queue");
                self.queues
                    .insert(spec.name.clone(), QueueState::new(spec.durable));
                Ok(())
            }
        }
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| OrderflowError::QueueNotFound(name.to_string()))
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory [`MessageBroker`]. Clones share the same broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the broker: every later call and settlement fails
    /// with `BrokerConnectionLost` until [`restart`](Self::restart)
    pub fn disconnect(&self) {
        self.shared.lock().disconnected = true;
        self.shared.changed.notify_waiters();
    }

    /// Simulate a broker restart.
    ///
    /// Transient queues are dropped. Unacknowledged messages return to their
    /// queue, then transient messages are discarded. Existing subscriptions
    /// and delivery handles become invalid.
    pub fn restart(&self) {
        {
            let mut state = self.shared.lock();
            state.disconnected = false;
            state.epoch += 1;
            state.queues.retain(|_, queue| queue.durable);
            for queue in state.queues.values_mut() {
                queue.requeue_unacked(|_| true);
                queue.ready.retain(|message| message.persistent);
            }
        }
        self.shared.changed.notify_waiters();
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    /// Messages waiting for delivery
    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Bodies of the messages waiting for delivery, head first
    pub fn ready_bodies(&self, queue: &str) -> Vec<Bytes> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.shared.lock();
        state.ensure_connected(None)?;
        state.declare(spec)
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        {
            let mut state = self.shared.lock();
            state.ensure_connected(None)?;
            let target = state.queue_mut(queue)?;
            target.ready.push_back(StoredMessage {
                body: message.body,
                persistent: message.persistent,
                deliveries: 0,
            });
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        spec: &QueueSpec,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        if options.prefetch == 0 {
            return Err(OrderflowError::config("prefetch must be greater than 0"));
        }

        let mut state = self.shared.lock();
        state.ensure_connected(None)?;
        state.declare(spec)?;

        state.next_subscriber += 1;
        let id = state.next_subscriber;
        debug!(
            queue = %spec.name,
            consumer = %options.consumer_name,
            subscriber = id,
            prefetch = options.prefetch,
            "Subscribed"
        );

        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            queue: spec.name.clone(),
            id,
            epoch: state.epoch,
            prefetch: usize::from(options.prefetch),
        }))
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
    queue: String,
    id: u64,
    epoch: u64,
    prefetch: usize,
}

impl MemorySubscription {
    /// Take the head message if this subscriber has spare capacity
    fn try_take(&self) -> Result<Option<Delivery>> {
        let mut guard = self.shared.lock();
        guard.ensure_connected(Some(self.epoch))?;

        let state = &mut *guard;
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| OrderflowError::QueueNotFound(self.queue.clone()))?;

        let in_flight = queue
            .unacked
            .values()
            .filter(|u| u.subscriber == self.id)
            .count();
        if in_flight >= self.prefetch {
            return Ok(None);
        }

        let Some(mut message) = queue.ready.pop_front() else {
            return Ok(None);
        };
        message.deliveries += 1;

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery::new(
            message.body.clone(),
            message.deliveries,
            Box::new(MemoryAcker {
                shared: Arc::clone(&self.shared),
                queue: self.queue.clone(),
                tag,
                epoch: self.epoch,
            }),
        );
        queue.unacked.insert(
            tag,
            Unacked {
                subscriber: self.id,
                message,
            },
        );

        Ok(Some(delivery))
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&mut self) -> Result<Delivery> {
        loop {
            // Register interest before looking, so a publish between the
            // check and the await still wakes us
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(delivery) = self.try_take()? {
                return Ok(delivery);
            }

            changed.await;
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let requeued = {
            let mut state = self.shared.lock();
            if state.epoch != self.epoch {
                return;
            }
            let id = self.id;
            state
                .queues
                .get_mut(&self.queue)
                .map_or(0, |queue| queue.requeue_unacked(|u| u.subscriber == id))
        };

        if requeued > 0 {
            debug!(queue = %self.queue, subscriber = self.id, requeued, "Requeued unacked messages");
            self.shared.changed.notify_waiters();
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
    epoch: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn settle(&mut self, settlement: Settlement) -> Result<()> {
        {
            let mut state = self.shared.lock();
            state.ensure_connected(Some(self.epoch))?;

            let queue = state.queue_mut(&self.queue)?;
            let unacked = queue.unacked.remove(&self.tag).ok_or_else(|| {
                OrderflowError::connection_lost(format!(
                    "unknown delivery tag {} on queue '{}'",
                    self.tag, self.queue
                ))
            })?;

            if settlement == Settlement::Requeue {
                queue.ready.push_front(unacked.message);
            }
        }

        // Capacity freed or a message is back
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(prefetch: u16) -> SubscribeOptions {
        SubscribeOptions {
            consumer_name: "test-workers".to_string(),
            prefetch,
        }
    }

    async fn broker_with(queue: &QueueSpec, bodies: &[&'static str]) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_queue(queue).await.unwrap();
        for body in bodies {
            broker
                .publish(&queue.name, OutboundMessage::persistent(*body))
                .await
                .unwrap();
        }
        broker
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = QueueSpec::durable("orders");
        let broker = broker_with(&queue, &["a", "b", "c"]).await;
        let mut sub = broker.subscribe(&queue, &options(1)).await.unwrap();

        for expected in ["a", "b", "c"] {
            let delivery = sub.next_delivery().await.unwrap();
            assert_eq!(delivery.body().as_ref(), expected.as_bytes());
            assert_eq!(delivery.attempt(), 1);
            delivery.ack().await.unwrap();
        }
        assert_eq!(broker.ready_count("orders"), 0);
        assert_eq!(broker.unacked_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_head_and_counts_attempts() {
        let queue = QueueSpec::durable("orders");
        let broker = broker_with(&queue, &["a", "b"]).await;
        let mut sub = broker.subscribe(&queue, &options(1)).await.unwrap();

        sub.next_delivery().await.unwrap().requeue().await.unwrap();

        let again = sub.next_delivery().await.unwrap();
        assert_eq!(again.body().as_ref(), b"a");
        assert_eq!(again.attempt(), 2);
        assert!(again.is_redelivery());
    }

    #[tokio::test]
    async fn test_reject_discards() {
        let queue = QueueSpec::durable("orders");
        let broker = broker_with(&queue, &["a"]).await;
        let mut sub = broker.subscribe(&queue, &options(1)).await.unwrap();

        sub.next_delivery().await.unwrap().reject().await.unwrap();

        assert_eq!(broker.ready_count("orders"), 0);
        assert_eq!(broker.unacked_count("orders"), 0);
    }

    #[tokio::test]
    async fn test_prefetch_blocks_until_settled() {
        let queue = QueueSpec::durable("orders");
        let broker = broker_with(&queue, &["a", "b"]).await;
        let mut sub = broker.subscribe(&queue, &options(1)).await.unwrap();

        let first = sub.next_delivery().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.next_delivery()).await;
        assert!(blocked.is_err(), "second delivery must wait for the first ack");
        assert_eq!(broker.unacked_count("orders"), 1);

        first.ack().await.unwrap();
        let second = sub.next_delivery().await.unwrap();
        assert_eq!(second.body().as_ref(), b"b");
    }

    #[tokio::test]
    async fn test_waiting_subscriber_wakes_on_publish() {
        let queue = QueueSpec::durable("orders");
        let broker = broker_with(&queue, &[]).await;
        let mut sub = broker.subscribe(&queue, &options(1)).await.unwrap();

        let publisher = broker.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("orders", OutboundMessage::persistent("late"))
                .await
                .unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), sub.next_delivery())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body().as_ref(), b"late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_subscription_requeues_in_delivery_order() {
        let queue = QueueSpec::durable("orders");
        let broker = broker_with(&queue, &["a", "b", "c"]).await;

        let mut sub = broker.subscribe(&queue, &options(2)).await.unwrap();
        let _a = sub.next_delivery().await.unwrap();
        let _b = sub.next_delivery().await.unwrap();
        assert_eq!(broker.unacked_count("orders"), 2);

        drop(sub);

        assert_eq!(broker.unacked_count("orders"), 0);
        let bodies = broker.ready_bodies("orders");
        assert_eq!(bodies, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }

    #[tokio::test]
    async fn test_settling_after_drop_fails() {
        let queue = QueueSpec::durable("orders");
        let broker = broker_with(&queue, &["a"]).await;

        let mut sub = broker.subscribe(&queue, &options(1)).await.unwrap();
        let delivery = sub.next_delivery().await.unwrap();
        drop(sub);

        let err = delivery.ack().await.unwrap_err();
        assert!(matches!(err, OrderflowError::BrokerConnectionLost(_)));
        assert_eq!(broker.ready_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_fails_calls() {
        let queue = QueueSpec::durable("orders");
        let broker = broker_with(&queue, &[]).await;
        let mut sub = broker.subscribe(&queue, &options(1)).await.unwrap();

        broker.disconnect();

        let err = broker
            .publish("orders", OutboundMessage::persistent("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderflowError::BrokerConnectionLost(_)));

        let err = sub.next_delivery().await.unwrap_err();
        assert!(matches!(err, OrderflowError::BrokerConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_zero_prefetch_is_rejected() {
        let broker = InMemoryBroker::new();
        let result = broker
            .subscribe(&QueueSpec::durable("orders"), &options(0))
            .await;
        assert!(matches!(result, Err(OrderflowError::Config(_))));
    }
}
