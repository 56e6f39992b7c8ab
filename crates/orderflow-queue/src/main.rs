//! orderflow-queue - publish order batches to, and consume them from, the work queue

use anyhow::Result;
use clap::{Parser, Subcommand};
use orderflow_common::config::Config;
use orderflow_common::logging::{init_logging, LogConfig, LogLevel};
use orderflow_common::source::HttpOrderSource;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use orderflow_queue::broker::NatsBroker;
use orderflow_queue::consumer::{LoggingOrderHandler, OrderConsumer};
use orderflow_queue::producer::OrderProducer;

#[derive(Parser)]
#[command(name = "orderflow-queue")]
#[command(about = "Publish and consume order batches over a durable queue", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch the current orders and publish them as one message
    Publish,

    /// Consume order batches until interrupted
    Consume,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("orderflow-queue")
        .filter_directives("async_nats=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _log_guard = init_logging(&log_config)?;

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "orderflow-queue failed");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let broker = Arc::new(NatsBroker::connect(&config.broker).await?);

    match cli.command {
        Commands::Publish => {
            let source = Arc::new(HttpOrderSource::new(&config.source)?);
            info!(source = %source.url(), "Fetching orders");
            let producer = OrderProducer::new(source, broker, config.broker.queue_name.clone());

            let published = producer.publish_batch().await?;
            info!(
                orders = published,
                queue = %producer.queue().name,
                "Sent orders to queue"
            );
        }
        Commands::Consume => {
            let consumer = OrderConsumer::new(broker, Arc::new(LoggingOrderHandler), &config.broker);

            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                trigger.cancel();
            });

            info!(
                queue = %config.broker.queue_name,
                consumer_id = %consumer.consumer_id(),
                "Waiting for messages. Press Ctrl+C to exit"
            );
            let stats = consumer.run(shutdown).await?;
            info!(
                consumer_id = %consumer.consumer_id(),
                acked = stats.acked,
                "Consumer exited cleanly"
            );
        }
    }

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, finishing in-flight message"),
        _ = terminate => info!("Received terminate signal, finishing in-flight message"),
    }
}
