//! Extract, transform, load

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument};

use orderflow_common::source::OrderSource;
use orderflow_common::{ExchangeRate, Result};

use crate::store::OrderStore;
use crate::transform;

/// Source of the per-run ingestion timestamp
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Statistics for one ETL run
#[derive(Debug, Clone, Default, Serialize)]
pub struct EtlStats {
    pub rows_extracted: u64,
    /// Rows written by the load step; equals the batch length on success
    pub rows_loaded: u64,
    pub rows_inserted: u64,
    pub rows_updated: u64,
    pub duration_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EtlStats {
    /// Start timing a run at `started_at`
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(started_at),
            ..Default::default()
        }
    }

    pub fn complete(&mut self, completed_at: DateTime<Utc>) {
        self.completed_at = Some(completed_at);
        if let (Some(start), Some(end)) = (self.started_at, self.completed_at) {
            self.duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
        }
    }
}

pub struct EtlPipeline {
    source: Arc<dyn OrderSource>,
    store: OrderStore,
    rate: ExchangeRate,
    clock: Arc<dyn Clock>,
}

impl EtlPipeline {
    pub fn new(source: Arc<dyn OrderSource>, store: OrderStore, rate: ExchangeRate) -> Self {
        Self {
            source,
            store,
            rate,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &OrderStore {
        &self.store
    }

    pub fn into_store(self) -> OrderStore {
        self.store
    }

    /// Run one batch.
    ///
    /// The source is read and every record transformed before the store is
    /// written, so an extract or transform failure leaves the store untouched.
    /// Run timings come from the pipeline's clock.
    #[instrument(skip(self), fields(rate = %self.rate))]
    pub async fn run(&self) -> Result<EtlStats> {
        let mut stats = EtlStats::new(self.clock.now());

        let batch = self.source.fetch_orders().await?;
        stats.rows_extracted = batch.len() as u64;

        let ingested_at = self.clock.now();
        let rows = transform::transform(&batch.orders, self.rate, ingested_at)?;

        let summary = self.store.upsert_batch(&rows).await?;
        stats.rows_loaded = summary.total();
        stats.rows_inserted = summary.inserted;
        stats.rows_updated = summary.updated;
        stats.complete(self.clock.now());

        info!(
            rows_extracted = stats.rows_extracted,
            rows_loaded = stats.rows_loaded,
            rows_inserted = stats.rows_inserted,
            rows_updated = stats.rows_updated,
            duration_secs = stats.duration_secs,
            "ETL run complete"
        );
        Ok(stats)
    }
}
