//! At-least-once delivery, fair dispatch and queue durability

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{batch_body, broker_config, wait_until_drained, RecordingHandler};
use orderflow_common::{OrderBatch, OrderflowError};
use orderflow_queue::broker::{
    InMemoryBroker, MessageBroker, OutboundMessage, QueueSpec, SubscribeOptions,
};
use orderflow_queue::OrderConsumer;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn workers(prefetch: u16) -> SubscribeOptions {
    SubscribeOptions {
        consumer_name: "orders-workers".to_string(),
        prefetch,
    }
}

async fn queue_with(broker: &InMemoryBroker, ids: impl IntoIterator<Item = i64>) -> QueueSpec {
    let queue = QueueSpec::durable("orders");
    broker.declare_queue(&queue).await.unwrap();
    for id in ids {
        broker
            .publish("orders", OutboundMessage::persistent(batch_body(id)))
            .await
            .unwrap();
    }
    queue
}

fn order_id(body: &[u8]) -> i64 {
    OrderBatch::from_json_bytes(body).unwrap().orders[0].id
}

#[tokio::test]
async fn test_unacked_message_is_redelivered_after_consumer_crash() {
    let broker = InMemoryBroker::new();
    let queue = queue_with(&broker, [1]).await;

    let mut crashed = broker.subscribe(&queue, &workers(1)).await.unwrap();
    let first = crashed.next_delivery().await.unwrap();
    assert_eq!(first.attempt(), 1);

    // Consumer dies without settling
    drop(first);
    drop(crashed);

    let mut survivor = broker.subscribe(&queue, &workers(1)).await.unwrap();
    let again = survivor.next_delivery().await.unwrap();

    assert_eq!(order_id(again.body()), 1);
    assert_eq!(again.attempt(), 2);
    assert!(again.is_redelivery());
    again.ack().await.unwrap();
    assert_eq!(broker.ready_count("orders"), 0);
}

#[tokio::test]
async fn test_killed_consumer_task_leaves_message_redeliverable() {
    let broker = InMemoryBroker::new();
    queue_with(&broker, [7]).await;

    let stuck = OrderConsumer::new(
        Arc::new(broker.clone()),
        Arc::new(RecordingHandler::slow(Duration::from_secs(3600))),
        &broker_config(5),
    );
    let task = tokio::spawn(async move { stuck.run(CancellationToken::new()).await });

    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.unacked_count("orders") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert_eq!(broker.unacked_count("orders"), 0);
    assert_eq!(broker.ready_count("orders"), 1);

    let handler = Arc::new(RecordingHandler::default());
    let healthy = OrderConsumer::new(Arc::new(broker.clone()), handler.clone(), &broker_config(5));
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { healthy.run(shutdown).await })
    };
    wait_until_drained(&broker, "orders").await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(handler.seen(), vec![7]);
}

#[tokio::test]
async fn test_prefetch_bounds_in_flight_messages_per_consumer() {
    let broker = InMemoryBroker::new();
    let queue = queue_with(&broker, 1..=4).await;

    let mut busy = broker.subscribe(&queue, &workers(1)).await.unwrap();
    let mut idle = broker.subscribe(&queue, &workers(1)).await.unwrap();

    let held = busy.next_delivery().await.unwrap();
    assert_eq!(order_id(held.body()), 1);

    // The busy consumer gets nothing more until it settles
    let blocked = tokio::time::timeout(Duration::from_millis(50), busy.next_delivery()).await;
    assert!(blocked.is_err());

    // Remaining work goes to the other consumer
    for expected in 2..=4 {
        let delivery = idle.next_delivery().await.unwrap();
        assert_eq!(order_id(delivery.body()), expected);
        assert_eq!(broker.unacked_count("orders"), 2);
        delivery.ack().await.unwrap();
    }

    held.ack().await.unwrap();
    assert_eq!(broker.ready_count("orders"), 0);
    assert_eq!(broker.unacked_count("orders"), 0);
}

#[tokio::test]
async fn test_competing_consumers_share_work_without_duplicates() {
    let broker = InMemoryBroker::new();
    queue_with(&broker, 1..=10).await;

    let first = Arc::new(RecordingHandler::slow(Duration::from_millis(10)));
    let second = Arc::new(RecordingHandler::slow(Duration::from_millis(10)));
    let shutdown = CancellationToken::new();

    let mut tasks = Vec::new();
    for handler in [first.clone(), second.clone()] {
        let consumer = OrderConsumer::new(Arc::new(broker.clone()), handler, &broker_config(5));
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move { consumer.run(shutdown).await }));
    }

    wait_until_drained(&broker, "orders").await;
    shutdown.cancel();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let (a, b) = (first.seen(), second.seen());
    assert!(!a.is_empty() && !b.is_empty(), "both consumers should get work: {:?} {:?}", a, b);

    let mut all: Vec<i64> = a.into_iter().chain(b).collect();
    all.sort_unstable();
    assert_eq!(all, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_persistent_messages_survive_restart() {
    let broker = InMemoryBroker::new();
    let durable = QueueSpec::durable("orders");
    let scratch = QueueSpec::transient("scratch");
    broker.declare_queue(&durable).await.unwrap();
    broker.declare_queue(&scratch).await.unwrap();

    broker
        .publish("orders", OutboundMessage::persistent(batch_body(1)))
        .await
        .unwrap();
    broker
        .publish("orders", OutboundMessage::transient(batch_body(2)))
        .await
        .unwrap();
    broker
        .publish("scratch", OutboundMessage::persistent(batch_body(3)))
        .await
        .unwrap();

    // One persistent message is in flight when the broker goes down
    broker
        .publish("orders", OutboundMessage::persistent(batch_body(4)))
        .await
        .unwrap();
    let mut sub = broker.subscribe(&durable, &workers(1)).await.unwrap();
    let in_flight = sub.next_delivery().await.unwrap();

    broker.restart();

    assert!(!broker.queue_exists("scratch"));
    let ids: Vec<i64> = broker
        .ready_bodies("orders")
        .iter()
        .map(|b| order_id(b))
        .collect();
    assert_eq!(ids, vec![1, 4]);

    // Handles from before the restart are dead
    let err = in_flight.ack().await.unwrap_err();
    assert!(matches!(err, OrderflowError::BrokerConnectionLost(_)));
    let err = sub.next_delivery().await.unwrap_err();
    assert!(matches!(err, OrderflowError::BrokerConnectionLost(_)));
}

#[tokio::test]
async fn test_redeclaring_with_different_durability_fails() {
    let broker = InMemoryBroker::new();
    broker.declare_queue(&QueueSpec::durable("orders")).await.unwrap();
    broker.declare_queue(&QueueSpec::durable("orders")).await.unwrap();

    let err = broker
        .declare_queue(&QueueSpec::transient("orders"))
        .await
        .unwrap_err();

    match err {
        OrderflowError::QueueConfigMismatch { queue, .. } => assert_eq!(queue, "orders"),
        other => panic!("expected QueueConfigMismatch, got {:?}", other),
    }
}

#[tokio::test]
async fn test_publish_to_undeclared_queue_fails() {
    let broker = InMemoryBroker::new();

    let err = broker
        .publish("nowhere", OutboundMessage::persistent(batch_body(1)))
        .await
        .unwrap_err();

    assert!(matches!(err, OrderflowError::QueueNotFound(ref q) if q == "nowhere"));
}
