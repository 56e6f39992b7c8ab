//! Shared fixtures for queue integration tests
//!
//! ```no_run
//! mod common;
//! use common::{batch_body, broker_config, RecordingHandler};
//! ```

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use orderflow_common::config::{BrokerConfig, Config};
use orderflow_common::{OrderBatch, OrderRecord};
use orderflow_queue::broker::InMemoryBroker;
use orderflow_queue::OrderHandler;
use rust_decimal_macros::dec;
use std::sync::Mutex;
use std::time::Duration;

pub fn broker_config(max_deliveries: u32) -> BrokerConfig {
    BrokerConfig {
        max_deliveries,
        ..Config::default().broker
    }
}

/// The three-order batch served by the sample order API
pub fn sample_batch() -> OrderBatch {
    OrderBatch::new(vec![
        OrderRecord::new(1, "Notebook", 2, dec!(4.50)),
        OrderRecord::new(2, "Pencils", 12, dec!(3.20)),
        OrderRecord::new(3, "Backpack", 1, dec!(29.99)),
    ])
}

/// One-order batch whose id tags the message
pub fn batch_body(id: i64) -> Vec<u8> {
    OrderBatch::new(vec![OrderRecord::new(id, "Stapler", 1, dec!(7.25))])
        .to_json_bytes()
        .unwrap()
}

/// Records handled order ids; optionally fails every call or sleeps first
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<i64>>,
    pub always_fail: bool,
    pub delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrderHandler for RecordingHandler {
    async fn handle(&self, order: &OrderRecord) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_fail {
            anyhow::bail!("order {} rejected by downstream", order.id);
        }
        self.seen.lock().unwrap().push(order.id);
        Ok(())
    }
}

/// Poll until the queue has nothing ready or in flight
pub async fn wait_until_drained(broker: &InMemoryBroker, queue: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.ready_count(queue) > 0 || broker.unacked_count(queue) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue was not drained in time");
}
