//! Producer to consumer round trips over the in-memory broker

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{batch_body, broker_config, sample_batch, wait_until_drained, RecordingHandler};
use orderflow_common::config::SourceConfig;
use orderflow_common::source::HttpOrderSource;
use orderflow_common::OrderflowError;
use orderflow_queue::broker::{InMemoryBroker, MessageBroker, OutboundMessage, QueueSpec};
use orderflow_queue::{OrderConsumer, OrderProducer};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn order_api(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(status).set_body_json(serde_json::json!({
            "orders": [
                {"id": 1, "item": "Notebook", "qty": 2, "price_usd": 4.50},
                {"id": 2, "item": "Pencils", "qty": 12, "price_usd": 3.20},
                {"id": 3, "item": "Backpack", "qty": 1, "price_usd": 29.99}
            ]
        })))
        .mount(&server)
        .await;
    server
}

fn http_source(server: &MockServer) -> Arc<HttpOrderSource> {
    Arc::new(
        HttpOrderSource::new(&SourceConfig {
            url: format!("{}/orders", server.uri()),
            timeout_secs: 5,
        })
        .unwrap(),
    )
}

#[tokio::test]
async fn test_round_trip_acknowledges_exactly_once() {
    let server = order_api(200).await;
    let broker = InMemoryBroker::new();

    let producer = OrderProducer::new(http_source(&server), Arc::new(broker.clone()), "orders");
    assert_eq!(producer.publish_batch().await.unwrap(), 3);
    assert_eq!(broker.ready_count("orders"), 1);

    let handler = Arc::new(RecordingHandler::default());
    let consumer = OrderConsumer::new(Arc::new(broker.clone()), handler.clone(), &broker_config(5));
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    wait_until_drained(&broker, "orders").await;
    shutdown.cancel();
    let stats = task.await.unwrap().unwrap();

    assert_eq!(stats.received, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.requeued, 0);
    assert_eq!(handler.seen(), vec![1, 2, 3]);
    assert_eq!(broker.ready_count("orders"), 0);
    assert_eq!(broker.unacked_count("orders"), 0);
}

#[tokio::test]
async fn test_consumer_started_first_receives_later_publish() {
    let server = order_api(200).await;
    let broker = InMemoryBroker::new();

    let handler = Arc::new(RecordingHandler::default());
    let consumer = OrderConsumer::new(Arc::new(broker.clone()), handler.clone(), &broker_config(5));
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    // Let the consumer declare and subscribe before anything is published
    tokio::time::sleep(Duration::from_millis(20)).await;
    let producer = OrderProducer::new(http_source(&server), Arc::new(broker.clone()), "orders");
    producer.publish_batch().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while handler.seen().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    shutdown.cancel();

    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.acked, 1);
}

#[tokio::test]
async fn test_source_outage_publishes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let broker = InMemoryBroker::new();

    let producer = OrderProducer::new(http_source(&server), Arc::new(broker.clone()), "orders");
    let err = producer.publish_batch().await.unwrap_err();

    assert!(matches!(err, OrderflowError::SourceUnavailable(_)));
    assert_eq!(broker.ready_count("orders"), 0);
}

#[tokio::test]
async fn test_failing_handler_is_dead_lettered_after_max_deliveries() {
    let broker = InMemoryBroker::new();
    broker.declare_queue(&QueueSpec::durable("orders")).await.unwrap();
    broker
        .publish("orders", OutboundMessage::persistent(batch_body(42)))
        .await
        .unwrap();

    let consumer = OrderConsumer::new(
        Arc::new(broker.clone()),
        Arc::new(RecordingHandler::failing()),
        &broker_config(3),
    );
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    wait_until_drained(&broker, "orders").await;
    shutdown.cancel();
    let stats = task.await.unwrap().unwrap();

    assert_eq!(stats.received, 3);
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.acked, 0);
    assert_eq!(
        broker.ready_bodies("orders_dead_letter"),
        vec![bytes::Bytes::from(batch_body(42))]
    );
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_message() {
    let broker = InMemoryBroker::new();
    let producer = OrderProducer::new(
        Arc::new(orderflow_common::source::StaticOrderSource::new(sample_batch())),
        Arc::new(broker.clone()),
        "orders",
    );
    producer.publish_batch().await.unwrap();
    producer.publish_batch().await.unwrap();

    let handler = Arc::new(RecordingHandler::slow(Duration::from_millis(50)));
    let consumer = OrderConsumer::new(Arc::new(broker.clone()), handler.clone(), &broker_config(5));
    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    // Cancel while the first batch is being handled
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.unacked_count("orders") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    shutdown.cancel();

    let stats = task.await.unwrap().unwrap();

    assert_eq!(stats.received, 1);
    assert_eq!(stats.acked, 1);
    assert_eq!(handler.seen(), vec![1, 2, 3]);
    assert_eq!(broker.unacked_count("orders"), 0);
    assert_eq!(broker.ready_count("orders"), 1, "second batch stays queued");
}
