//! Order source client
//!
//! The order source is an external HTTP service answering `GET /orders` with
//! the full current set of orders. Both the producer and the ETL pipeline
//! read it through [`OrderSource`] so tests can substitute fixed data.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use crate::config::SourceConfig;
use crate::error::{OrderflowError, Result};
use crate::types::OrderBatch;

/// Read-only provider of the current order batch
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Fetch the full current set of orders.
    ///
    /// Fails with [`OrderflowError::SourceUnavailable`] when the call does not
    /// succeed within the configured timeout.
    async fn fetch_orders(&self) -> Result<OrderBatch>;
}

/// [`OrderSource`] backed by the order HTTP API
pub struct HttpOrderSource {
    client: Client,
    url: String,
}

impl HttpOrderSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| OrderflowError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl OrderSource for HttpOrderSource {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch_orders(&self) -> Result<OrderBatch> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| describe_transport_error(&self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(OrderflowError::source_unavailable(format!(
                "GET {} returned {}",
                self.url, status
            )));
        }

        let batch: OrderBatch = response.json().await.map_err(|e| {
            OrderflowError::source_unavailable(format!(
                "GET {} returned an undecodable body: {}",
                self.url, e
            ))
        })?;

        debug!(orders = batch.len(), "Fetched order batch");
        Ok(batch)
    }
}

/// Static in-process source, used for local runs and tests
#[derive(Debug, Clone, Default)]
pub struct StaticOrderSource {
    batch: OrderBatch,
}

impl StaticOrderSource {
    pub fn new(batch: OrderBatch) -> Self {
        Self { batch }
    }
}

#[async_trait]
impl OrderSource for StaticOrderSource {
    async fn fetch_orders(&self) -> Result<OrderBatch> {
        Ok(self.batch.clone())
    }
}

fn describe_transport_error(url: &str, err: reqwest::Error) -> OrderflowError {
    if err.is_timeout() {
        OrderflowError::source_unavailable(format!("GET {} timed out", url))
    } else {
        OrderflowError::source_unavailable(format!("GET {} failed: {}", url, err))
    }
}
