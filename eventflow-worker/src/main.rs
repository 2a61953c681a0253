//! Worker pool: consumes queued events and runs each through the
//! dedup / validate / enrich / persist state machine.

use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use eventflow_common::metrics::start_exporter;
use eventflow_common::queue::{Queue, RedisQueue};
use eventflow_common::retry::Backoff;
use eventflow_common::shutdown::ShutdownSignal;
use eventflow_common::store::PgStore;

use eventflow_worker::config::Config;
use eventflow_worker::processor::Processor;
use eventflow_worker::worker::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().expect("invalid configuration:");

    let log_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(&config.log_level)
        }));
    tracing_subscriber::registry().with(log_layer).init();

    tracing::info!(worker_count = config.worker_count, "starting worker pool");

    if config.export_prometheus {
        let bind = config.metrics_address.clone();
        tokio::task::spawn(async move {
            start_exporter(&bind)
                .await
                .expect("failed to start serving metrics");
        });
    }

    let store = PgStore::connect(
        &config.database_url,
        config.pool_size(),
        config.store_timeout.0,
    )
    .await?;
    sqlx::migrate!("../migrations").run(store.pool()).await?;
    tracing::info!("database initialized");

    let queue = RedisQueue::connect(
        &config.redis_url,
        &config.stream_name,
        &config.consumer_group,
    )
    .await?;
    queue.ensure_group().await?;
    tracing::info!(
        stream = %config.stream_name,
        group = %config.consumer_group,
        "connected to queue"
    );

    let store: Arc<PgStore> = Arc::new(store);
    let queue: Arc<dyn Queue> = Arc::new(queue);
    let shutdown = ShutdownSignal::new();
    let backoff = Backoff::new(
        Duration::from_secs(config.retry_base_s),
        Duration::from_secs(config.retry_max_s),
    );

    let mut handles = Vec::with_capacity(config.worker_count);
    for index in 0..config.worker_count {
        let consumer = format!("{}-{}", config.worker_id, index + 1);
        let processor = Processor::new(
            store.clone(),
            &consumer,
            config.max_retries,
            backoff,
            config.high_value_threshold,
        );
        let worker = Worker::new(
            &consumer,
            queue.clone(),
            processor,
            config.batch_size,
            config.block_timeout.0,
            config.idle_reclaim.0,
            shutdown.clone(),
        );
        handles.push(tokio::spawn(worker.run()));
    }

    shutdown.listen_for_signals().await;

    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(config.drain_deadline.0, drain)
        .await
        .is_err()
    {
        tracing::warn!(
            deadline_ms = config.drain_deadline.0.as_millis() as u64,
            "drain deadline reached, abandoning in-flight entries for redelivery"
        );
    }

    tracing::info!("worker pool shutdown complete");
    Ok(())
}
