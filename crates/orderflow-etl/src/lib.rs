//! Orderflow ETL Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch job that copies the current orders from the order source into SQLite,
//! converting prices into the target currency on the way.
//!
//! - **Transform**: exact decimal conversion, half-even to cents ([`transform`])
//! - **Store**: one transactional upsert per batch, keyed by order id ([`store`])
//! - **Pipeline**: extract, transform, load with run statistics ([`pipeline`])
//!
//! Re-running against an unchanged source and rate leaves the business columns
//! unchanged.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use orderflow_common::{config::Config, source::HttpOrderSource};
//! use orderflow_etl::{pipeline::EtlPipeline, store::OrderStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let store = OrderStore::open(&config.store).await?;
//!     let source = Arc::new(HttpOrderSource::new(&config.source)?);
//!
//!     let stats = EtlPipeline::new(source, store, config.etl.exchange_rate).run().await?;
//!     println!("loaded {} rows", stats.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod pipeline;
pub mod store;
pub mod transform;

pub use pipeline::{Clock, EtlPipeline, EtlStats, FixedClock, SystemClock};
pub use store::{OrderStore, StoredOrderRow};
pub use transform::TransformedOrder;
