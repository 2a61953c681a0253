//! The per-entry processing state machine.
//!
//! Every delivery moves through: dedup lookup, validation, enrichment,
//! persist (with bounded backoff retries), then a terminal [`Outcome`].
//! All outcomes except [`Outcome::Abandoned`] are acknowledged by the
//! worker; an abandoned entry stays pending and comes back through
//! stale-entry reclaim.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{info, warn, Instrument};

use eventflow_common::event::{
    Enrichment, Event, EventKind, NewFailedRecord, NewProcessedRecord, STATUS_COMPLETED,
};
use eventflow_common::retry::Backoff;
use eventflow_common::store::{Store, StoreError};

use crate::error::ProcessingError;

/// Enrichment tag applied to purchases above the configured threshold.
pub const HIGH_VALUE_TAG: &str = "high_value";

/// Terminal state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A processed row was committed.
    Processed,
    /// A processed row already existed, found either by the dedup lookup or
    /// by losing the insert race to another worker.
    Duplicate,
    /// Validation failed; a failed row was committed without retries.
    Rejected,
    /// Persist attempts were exhausted; a failed row was committed.
    DeadLettered,
    /// The payload can never be processed and carries nothing worth
    /// dead-lettering; acknowledged and dropped.
    Discarded,
    /// No terminal row could be committed. Not acknowledged: redelivery via
    /// reclaim retries the whole state machine later.
    Abandoned,
}

impl Outcome {
    pub fn should_ack(&self) -> bool {
        !matches!(self, Outcome::Abandoned)
    }
}

pub struct Processor {
    store: Arc<dyn Store>,
    worker_id: String,
    max_retries: u32,
    backoff: Backoff,
    high_value_threshold: f64,
}

impl Processor {
    pub fn new(
        store: Arc<dyn Store>,
        worker_id: &str,
        max_retries: u32,
        backoff: Backoff,
        high_value_threshold: f64,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.to_owned(),
            max_retries,
            backoff,
            high_value_threshold,
        }
    }

    /// Drive one queue payload to a terminal outcome. Never panics and
    /// never returns early without classifying the delivery.
    pub async fn process(&self, payload: &str) -> Outcome {
        let event: Event = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(error) => {
                warn!(error = %error, "discarding undecodable queue payload");
                counter!(
                    "events_failed_total",
                    &[("reason", "malformed".to_string())]
                )
                .increment(1);
                return Outcome::Discarded;
            }
        };

        let span = tracing::info_span!(
            "process_event",
            correlation_id = %event.fingerprint,
            worker_id = %self.worker_id,
            kind = %event.kind,
        );
        self.drive(&event).instrument(span).await
    }

    async fn drive(&self, event: &Event) -> Outcome {
        let started = Instant::now();
        let kind_labels = [("kind", event.kind.as_str().to_string())];

        match self.store.exists_processed(event.fingerprint).await {
            Ok(true) => {
                info!("duplicate event detected, skipping");
                counter!("events_duplicate_total", &kind_labels).increment(1);
                return Outcome::Duplicate;
            }
            Ok(false) => {}
            Err(error) => {
                warn!(error = %error, "dedup lookup failed, leaving entry for redelivery");
                return Outcome::Abandoned;
            }
        }

        if let Err(error) = validate(event) {
            info!(error = %error, "event rejected by validation");
            return self.dead_letter(event, &error.to_string(), "validation", 0).await;
        }

        let enrichment = self.enrich(event);

        let mut attempt: u32 = 0;
        loop {
            let record = NewProcessedRecord {
                fingerprint: event.fingerprint,
                kind: event.kind,
                subject_id: event.subject_id.clone(),
                occurred_at: event.occurred_at,
                properties: event.properties.clone(),
                processed_at: enrichment.processed_at,
                status: STATUS_COMPLETED.to_string(),
                enrichment: enrichment.clone(),
                retry_count: attempt as i32,
            };

            match self.store.insert_processed(&record).await {
                Ok(()) => {
                    counter!("events_processed_total", &kind_labels).increment(1);
                    histogram!("event_processing_duration_seconds", &kind_labels)
                        .record(started.elapsed().as_secs_f64());
                    info!(retry_count = attempt, "event processed successfully");
                    return Outcome::Processed;
                }
                Err(StoreError::UniqueViolation(_)) => {
                    info!("lost the processed-insert race, treating as duplicate");
                    counter!("events_duplicate_total", &kind_labels).increment(1);
                    return Outcome::Duplicate;
                }
                Err(error) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        warn!(error = %error, attempts = attempt, "persist attempts exhausted");
                        let error = ProcessingError::from(error);
                        return self
                            .dead_letter(event, &error.to_string(), "persist", attempt as i32)
                            .await;
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        error = %error,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "persist failed, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Compute derived fields. Pure over event + config: no I/O happens
    /// here, so nothing on this path can force a retry.
    fn enrich(&self, event: &Event) -> Enrichment {
        let mut enrichment = Enrichment {
            worker_id: self.worker_id.clone(),
            processed_at: Utc::now(),
            tag: None,
            session_start: None,
        };

        match event.kind {
            EventKind::Purchase => {
                let amount = event
                    .properties
                    .get("amount")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                if amount > self.high_value_threshold {
                    enrichment.tag = Some(HIGH_VALUE_TAG.to_string());
                }
            }
            EventKind::PageView => {
                enrichment.session_start = Some(event.occurred_at);
            }
            EventKind::UserSignup | EventKind::Custom => {}
        }

        enrichment
    }

    /// Append the terminal failure row. When even this write fails the
    /// entry is abandoned so redelivery can try again.
    async fn dead_letter(
        &self,
        event: &Event,
        error_message: &str,
        reason: &'static str,
        retry_count: i32,
    ) -> Outcome {
        let record = NewFailedRecord {
            fingerprint: event.fingerprint,
            payload: serde_json::to_value(event).unwrap_or(Value::Null),
            error_message: error_message.to_owned(),
            failed_at: Utc::now(),
            retry_count,
        };

        match self.store.insert_failed(&record).await {
            Ok(()) => {
                counter!("events_failed_total", &[("reason", reason.to_string())]).increment(1);
                info!(reason, error = %error_message, "event moved to dead letter queue");
                if reason == "validation" {
                    Outcome::Rejected
                } else {
                    Outcome::DeadLettered
                }
            }
            Err(error) => {
                warn!(error = %error, "failed to dead-letter event, leaving entry for redelivery");
                Outcome::Abandoned
            }
        }
    }
}

/// Kind-specific business rules. Violations are permanent.
fn validate(event: &Event) -> Result<(), ProcessingError> {
    match event.kind {
        EventKind::Purchase => {
            let amount = event.properties.get("amount");
            let Some(amount) = amount else {
                return Err(ProcessingError::Validation(
                    "purchase events must have an amount".to_string(),
                ));
            };
            match amount.as_f64() {
                Some(amount) if amount > 0.0 => {}
                _ => {
                    return Err(ProcessingError::Validation(
                        "purchase amount must be a positive number".to_string(),
                    ))
                }
            }
        }
        EventKind::UserSignup => {
            if event
                .subject_id
                .as_deref()
                .map_or(true, |subject| subject.is_empty())
            {
                return Err(ProcessingError::Validation(
                    "user_signup events must have a subject_id".to_string(),
                ));
            }
        }
        EventKind::PageView | EventKind::Custom => {}
    }

    if event.occurred_at > Utc::now() {
        return Err(ProcessingError::Validation(
            "event occurred_at cannot be in the future".to_string(),
        ));
    }

    Ok(())
}
