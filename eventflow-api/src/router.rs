use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum::{
    routing::{get, post},
    Router,
};
use metrics::{counter, histogram};
use tower_http::trace::TraceLayer;

use eventflow_common::queue::Queue;
use eventflow_common::store::Store;

use crate::ingest;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn Queue>,
}

/// Count and time every request against the ingestion surface, keyed by
/// endpoint and response status.
async fn record_request(request: Request<Body>, next: Next) -> Response {
    let endpoint = match request.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_owned(),
        None => request.uri().path().to_owned(),
    };
    let accepted_at = Instant::now();

    let response = next.run(request).await;

    let labels = [
        ("endpoint", endpoint),
        ("status", response.status().as_u16().to_string()),
    ];
    counter!("ingest_requests_total", &labels).increment(1);
    histogram!("ingest_request_duration_seconds", &labels)
        .record(accepted_at.elapsed().as_secs_f64());

    response
}

pub fn router(store: Arc<dyn Store>, queue: Arc<dyn Queue>) -> Router {
    let state = AppState { store, queue };

    Router::new()
        .route("/", get(ingest::index))
        .route("/events", post(ingest::submit))
        .route("/health", get(ingest::health))
        .route("/metrics/summary", get(ingest::queue_stats))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(record_request))
        .with_state(state)
}
