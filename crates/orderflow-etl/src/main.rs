//! orderflow-etl - load the current orders into the SQLite store

use anyhow::Result;
use clap::Parser;
use orderflow_common::config::Config;
use orderflow_common::logging::{init_logging, LogConfig, LogLevel};
use orderflow_common::source::HttpOrderSource;
use orderflow_etl::{EtlPipeline, OrderStore};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "orderflow-etl")]
#[command(author, version, about = "Extract orders, convert prices and upsert them into SQLite")]
struct Cli {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("orderflow-etl")
        .filter_directives("sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _log_guard = init_logging(&log_config)?;

    if let Err(e) = run().await {
        error!(error = %format!("{:#}", e), "ETL run failed");
        return Err(e);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let config = Config::load()?;
    info!(
        source = %config.source.url,
        db = %config.store.path.display(),
        rate = %config.etl.exchange_rate,
        "Starting ETL run"
    );

    let source = Arc::new(HttpOrderSource::new(&config.source)?);
    let store = OrderStore::open(&config.store).await?;
    let pipeline = EtlPipeline::new(source, store, config.etl.exchange_rate);

    let stats = pipeline.run().await?;
    pipeline.into_store().close().await;

    info!(
        rows_loaded = stats.rows_loaded,
        db = %config.store.path.display(),
        "ETL complete"
    );
    Ok(())
}
