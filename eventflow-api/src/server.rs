use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use eventflow_common::queue::{Queue, RedisQueue};
use eventflow_common::store::PgStore;

use crate::config::Config;
use crate::router::router;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let store = PgStore::connect(
        &config.database_url,
        config.pg_pool_size,
        Duration::from_millis(config.store_timeout_ms),
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
    tracing::info!(stream = %config.stream_name, "connected to queue");

    let app = router(Arc::new(store), Arc::new(queue));

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
