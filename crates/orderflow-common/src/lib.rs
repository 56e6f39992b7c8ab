//! Orderflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, configuration, and error handling for the orderflow workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`OrderflowError`] and the [`Result`] alias used by every crate
//! - **Types**: [`OrderRecord`], [`OrderBatch`] and the [`ExchangeRate`] newtype
//! - **Configuration**: environment-backed [`config::Config`], built once at startup
//! - **Order Source**: the [`source::OrderSource`] trait and its HTTP client
//! - **Logging**: tracing subscriber setup shared by all binaries
//!
//! # Example
//!
//! ```no_run
//! use orderflow_common::config::Config;
//! use orderflow_common::source::{HttpOrderSource, OrderSource};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let source = HttpOrderSource::new(&config.source)?;
//!     let batch = source.fetch_orders().await?;
//!     tracing::info!(orders = batch.len(), "fetched orders");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod source;
pub mod types;

// Re-export commonly used types
pub use error::{OrderflowError, Result};
pub use types::{ExchangeRate, OrderBatch, OrderRecord};
