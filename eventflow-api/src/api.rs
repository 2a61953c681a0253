use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use eventflow_common::queue::QueueError;
use eventflow_common::store::StoreError;

pub const ACCEPTED_STATUS: &str = "accepted";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("an event with fingerprint {0} was already accepted")]
    DuplicateSubmission(Uuid),

    #[error("failed to encode event payload: {0}")]
    PayloadEncodingError(#[from] serde_json::Error),

    #[error("failed to record event")]
    StoreUnavailable(StoreError),

    #[error("failed to enqueue event")]
    QueueUnavailable(#[from] QueueError),
}

impl From<StoreError> for ApiError {
    /// A raw-insert unique violation means the producer replayed a
    /// fingerprint it already got an answer for; that is the producer's
    /// error, not ours.
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::UniqueViolation(fingerprint) => ApiError::DuplicateSubmission(fingerprint),
            other => ApiError::StoreUnavailable(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::DuplicateSubmission(_) => (StatusCode::CONFLICT, self.to_string()),

            ApiError::PayloadEncodingError(_)
            | ApiError::StoreUnavailable(_)
            | ApiError::QueueUnavailable(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        }
        .into_response()
    }
}

/// Body returned to a producer once its event is durably accepted. The
/// response is sent without waiting on worker processing.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub fingerprint: Uuid,
    pub status: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub store: String,
    pub queue: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: ComponentHealth,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub queue_length: u64,
    pub pending_messages: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service: String,
    pub version: String,
    pub status: String,
}
