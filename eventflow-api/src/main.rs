//! Ingestion front-end: accepts events over HTTP, records the raw audit
//! copy, and hands the event to the queue for asynchronous processing.

use envconfig::Envconfig;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use eventflow_common::metrics::start_exporter;

mod api;
mod config;
mod ingest;
mod router;
mod server;

use config::Config;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().expect("invalid configuration:");

    let log_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(&config.log_level)
        }));
    tracing_subscriber::registry().with(log_layer).init();

    tracing::info!("starting ingestion service");

    if config.export_prometheus {
        let bind = config.metrics_address.clone();
        tokio::task::spawn(async move {
            start_exporter(&bind)
                .await
                .expect("failed to start serving metrics");
        });
    }

    let listener = tokio::net::TcpListener::bind(config.address).await?;
    server::serve(config, listener, shutdown()).await
}
