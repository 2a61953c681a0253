//! Prometheus wiring for the pipeline's observability contract.
//!
//! Counters and histograms are emitted inline at their call sites; this
//! module owns recorder installation, the scrape endpoint, and the gauges
//! shared across workers. The scrape endpoint lives on its own port,
//! separate from any request-serving surface.

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};

/// Buckets for the `event_processing_duration_seconds` histogram. Most
/// entries finish well under a second; the tail covers the full persist
/// retry schedule.
const DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Install the global recorder and serve the scrape endpoint on `bind`.
/// Runs until the process exits; callers spawn it as its own task.
pub async fn start_exporter(bind: &str) -> std::io::Result<()> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("event_processing_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to configure duration buckets")
        .install_recorder()
        .expect("failed to install metrics recorder");

    let app = Router::new().route("/metrics", get(move || async move { handle.render() }));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await
}

/// Refresh the queue gauges. Sampled by each worker once per consume cycle.
pub fn sample_queue_gauges(queue_depth: u64, pending_messages: u64) {
    metrics::gauge!("queue_depth").set(queue_depth as f64);
    metrics::gauge!("pending_messages").set(pending_messages as f64);
}

pub fn worker_started() {
    metrics::gauge!("active_workers").increment(1.0);
}

pub fn worker_stopped() {
    metrics::gauge!("active_workers").decrement(1.0);
}
