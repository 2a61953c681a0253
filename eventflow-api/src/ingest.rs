use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use metrics::counter;
use tracing::instrument;

use eventflow_common::event::EventSubmission;

use crate::api::{
    ApiError, ComponentHealth, HealthResponse, QueueStatsResponse, ServiceDescriptor,
    SubmitResponse, ACCEPTED_STATUS,
};
use crate::router::AppState;

/// Accept a single event submission.
///
/// Structural validation happens in the extractor: a payload that does not
/// deserialize into [`EventSubmission`] is rejected before any durable
/// write. After that the contract is strictly ordered: raw audit insert
/// first, queue publish second, and the 202 only after both. A failed raw
/// insert never enqueues; a failed publish leaves the raw row behind as an
/// audit-only orphan.
#[instrument(skip_all, fields(correlation_id, kind))]
pub async fn submit(
    State(state): State<AppState>,
    Json(submission): Json<EventSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let received_at = Utc::now();
    let event = submission.normalize(received_at);

    tracing::Span::current().record(
        "correlation_id",
        tracing::field::display(event.fingerprint),
    );
    tracing::Span::current().record("kind", event.kind.as_str());

    let labels = [("kind", event.kind.as_str().to_string())];
    counter!("events_received_total", &labels).increment(1);

    let payload = serde_json::to_value(&event)?;

    state
        .store
        .insert_raw(event.fingerprint, &payload, received_at)
        .await?;
    tracing::info!("event recorded");

    let entry_id = state.queue.publish(&payload.to_string()).await?;
    tracing::info!(entry_id = %entry_id, "event published to queue");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            fingerprint: event.fingerprint,
            status: ACCEPTED_STATUS.to_string(),
            received_at,
        }),
    ))
}

/// Probe both dependencies and report a combined status.
pub async fn health(State(state): State<AppState>) -> Response {
    let store_healthy = state.store.ping().await.is_ok();
    let queue_healthy = state.queue.ping().await.is_ok();

    let label = |healthy: bool| {
        if healthy {
            "healthy".to_string()
        } else {
            "unhealthy".to_string()
        }
    };

    let healthy = store_healthy && queue_healthy;
    let body = HealthResponse {
        status: label(healthy),
        components: ComponentHealth {
            store: label(store_healthy),
            queue: label(queue_healthy),
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(body)).into_response()
}

/// Current queue length and delivered-but-unacknowledged count.
pub async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<QueueStatsResponse>, ApiError> {
    let queue_length = state.queue.length().await?;
    let pending_messages = state.queue.pending_count().await?;

    Ok(Json(QueueStatsResponse {
        queue_length,
        pending_messages,
        timestamp: Utc::now(),
    }))
}

pub async fn index() -> Json<ServiceDescriptor> {
    Json(ServiceDescriptor {
        service: "eventflow-api".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "running".to_string(),
    })
}
