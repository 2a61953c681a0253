//! # Store
//!
//! Transactional persistence over PostgreSQL for the three event tables.
//!
//! Ownership is split by component: the ingestion service only writes
//! `raw_events`, workers only write `processed_events` / `failed_events`.
//! Uniqueness on fingerprint is what serializes racing workers: the losing
//! insert surfaces as [`StoreError::UniqueViolation`] and the caller treats
//! the event as already processed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{NewFailedRecord, NewProcessedRecord};

/// Enumeration of errors for store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {0}")]
    ConnectionError(sqlx::Error),
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("{command} timed out after {timeout:?}")]
    TimeoutError {
        command: &'static str,
        timeout: Duration,
    },
    #[error("fingerprint {0} already exists")]
    UniqueViolation(Uuid),
}

impl StoreError {
    /// Whether retrying the operation later could succeed. Everything but a
    /// unique-constraint violation is considered transient; pool exhaustion
    /// and per-operation timeouts fall on the transient side.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::UniqueViolation(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Dedup reads and terminal writes used by the pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    /// Record the audit copy of an accepted submission. Fails with
    /// [`StoreError::UniqueViolation`] when the fingerprint was already
    /// accepted.
    async fn insert_raw(
        &self,
        fingerprint: Uuid,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Point lookup on the processed table's unique fingerprint index.
    async fn exists_processed(&self, fingerprint: Uuid) -> StoreResult<bool>;

    /// Insert the terminal success row. A [`StoreError::UniqueViolation`]
    /// means another worker finished first.
    async fn insert_processed(&self, record: &NewProcessedRecord) -> StoreResult<()>;

    /// Append a terminal failure row. Never unique-constrained.
    async fn insert_failed(&self, record: &NewFailedRecord) -> StoreResult<()>;

    /// Round-trip connectivity probe.
    async fn ping(&self) -> StoreResult<()>;
}

/// [`Store`] implementation over a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl PgStore {
    /// Connect a pool sized for `max_connections` concurrent operations.
    /// Each store call gets its own per-attempt deadline of `op_timeout`,
    /// independent of any retry schedule the caller runs.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        op_timeout: Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(op_timeout)
            .connect(url)
            .await
            .map_err(StoreError::ConnectionError)?;

        Ok(Self { pool, op_timeout })
    }

    pub fn from_pool(pool: PgPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn bounded<T, F>(&self, command: &'static str, fut: F) -> StoreResult<T>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(map_sqlx_error(command, error, None)),
            Err(_) => Err(StoreError::TimeoutError {
                command,
                timeout: self.op_timeout,
            }),
        }
    }
}

fn map_sqlx_error(command: &'static str, error: sqlx::Error, fingerprint: Option<Uuid>) -> StoreError {
    if let (sqlx::Error::Database(db_error), Some(fingerprint)) = (&error, fingerprint) {
        if db_error.is_unique_violation() {
            return StoreError::UniqueViolation(fingerprint);
        }
    }
    StoreError::QueryError { command, error }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_raw(
        &self,
        fingerprint: Uuid,
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
INSERT INTO raw_events (fingerprint, payload, received_at)
VALUES ($1, $2, $3)
            "#,
        )
        .bind(fingerprint)
        .bind(sqlx::types::Json(payload))
        .bind(received_at)
        .execute(&self.pool);

        match tokio::time::timeout(self.op_timeout, query).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => Err(map_sqlx_error("INSERT raw_events", error, Some(fingerprint))),
            Err(_) => Err(StoreError::TimeoutError {
                command: "INSERT raw_events",
                timeout: self.op_timeout,
            }),
        }
    }

    async fn exists_processed(&self, fingerprint: Uuid) -> StoreResult<bool> {
        let query = sqlx::query_scalar(
            r#"
SELECT EXISTS (SELECT 1 FROM processed_events WHERE fingerprint = $1)
            "#,
        )
        .bind(fingerprint)
        .fetch_one(&self.pool);

        self.bounded("SELECT processed_events", query).await
    }

    async fn insert_processed(&self, record: &NewProcessedRecord) -> StoreResult<()> {
        let properties = serde_json::to_value(&record.properties).unwrap_or(Value::Null);
        let enrichment = serde_json::to_value(&record.enrichment).unwrap_or(Value::Null);
        let query = sqlx::query(
            r#"
INSERT INTO processed_events
    (fingerprint, kind, subject_id, occurred_at, properties, processed_at, status, enrichment, retry_count)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.fingerprint)
        .bind(record.kind.as_str())
        .bind(&record.subject_id)
        .bind(record.occurred_at)
        .bind(sqlx::types::Json(properties))
        .bind(record.processed_at)
        .bind(&record.status)
        .bind(sqlx::types::Json(enrichment))
        .bind(record.retry_count)
        .execute(&self.pool);

        match tokio::time::timeout(self.op_timeout, query).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => Err(map_sqlx_error(
                "INSERT processed_events",
                error,
                Some(record.fingerprint),
            )),
            Err(_) => Err(StoreError::TimeoutError {
                command: "INSERT processed_events",
                timeout: self.op_timeout,
            }),
        }
    }

    async fn insert_failed(&self, record: &NewFailedRecord) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
INSERT INTO failed_events (fingerprint, payload, error_message, failed_at, retry_count)
VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.fingerprint)
        .bind(sqlx::types::Json(&record.payload))
        .bind(&record.error_message)
        .bind(record.failed_at)
        .bind(record.retry_count)
        .execute(&self.pool);

        self.bounded("INSERT failed_events", query).await.map(|_| ())
    }

    async fn ping(&self) -> StoreResult<()> {
        let query = sqlx::query("SELECT 1").execute(&self.pool);
        self.bounded("SELECT 1", query).await.map(|_| ())
    }
}

#[derive(Default)]
struct MockStoreInner {
    raw: HashMap<Uuid, Value>,
    processed: HashMap<Uuid, NewProcessedRecord>,
    failed: Vec<NewFailedRecord>,
    transient_failures: usize,
    processed_insert_failures: usize,
    processed_insert_attempts: usize,
    failed_insert_failures: usize,
    dedup_always_negative: bool,
    fail_ping: bool,
}

/// In-memory [`Store`] for tests. `inject_transient_failures(n)` makes the
/// next `n` operations fail with a transient error before service resumes,
/// which is how outage windows are scripted.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<MockStoreInner>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_transient_failures(&self, count: usize) {
        self.inner.lock().unwrap().transient_failures = count;
    }

    /// Fail only the next `count` processed inserts, leaving reads alone.
    pub fn inject_processed_insert_failures(&self, count: usize) {
        self.inner.lock().unwrap().processed_insert_failures = count;
    }

    /// Total processed-insert attempts observed, successful or not.
    pub fn processed_insert_attempts(&self) -> usize {
        self.inner.lock().unwrap().processed_insert_attempts
    }

    /// Fail only the next `count` failed-row inserts.
    pub fn inject_failed_insert_failures(&self, count: usize) {
        self.inner.lock().unwrap().failed_insert_failures = count;
    }

    /// Make the dedup lookup report "not seen" regardless of state. This
    /// reproduces the window where two workers race the same fingerprint.
    pub fn set_dedup_always_negative(&self, value: bool) {
        self.inner.lock().unwrap().dedup_always_negative = value;
    }

    pub fn set_fail_ping(&self, fail: bool) {
        self.inner.lock().unwrap().fail_ping = fail;
    }

    pub fn raw_count(&self) -> usize {
        self.inner.lock().unwrap().raw.len()
    }

    pub fn raw_payload(&self, fingerprint: Uuid) -> Option<Value> {
        self.inner.lock().unwrap().raw.get(&fingerprint).cloned()
    }

    pub fn processed(&self, fingerprint: Uuid) -> Option<NewProcessedRecord> {
        self.inner.lock().unwrap().processed.get(&fingerprint).cloned()
    }

    pub fn processed_count(&self) -> usize {
        self.inner.lock().unwrap().processed.len()
    }

    pub fn failed_rows(&self) -> Vec<NewFailedRecord> {
        self.inner.lock().unwrap().failed.clone()
    }

    /// Pre-seed a processed row, as if another worker had already won.
    pub fn seed_processed(&self, record: NewProcessedRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.processed.insert(record.fingerprint, record);
    }

    fn take_transient_failure(inner: &mut MockStoreInner, command: &'static str) -> StoreResult<()> {
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(StoreError::QueryError {
                command,
                error: sqlx::Error::PoolTimedOut,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MockStore {
    async fn insert_raw(
        &self,
        fingerprint: Uuid,
        payload: &Value,
        _received_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_transient_failure(&mut inner, "INSERT raw_events")?;
        if inner.raw.contains_key(&fingerprint) {
            return Err(StoreError::UniqueViolation(fingerprint));
        }
        inner.raw.insert(fingerprint, payload.clone());
        Ok(())
    }

    async fn exists_processed(&self, fingerprint: Uuid) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_transient_failure(&mut inner, "SELECT processed_events")?;
        if inner.dedup_always_negative {
            return Ok(false);
        }
        Ok(inner.processed.contains_key(&fingerprint))
    }

    async fn insert_processed(&self, record: &NewProcessedRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.processed_insert_attempts += 1;
        Self::take_transient_failure(&mut inner, "INSERT processed_events")?;
        if inner.processed_insert_failures > 0 {
            inner.processed_insert_failures -= 1;
            return Err(StoreError::QueryError {
                command: "INSERT processed_events",
                error: sqlx::Error::PoolTimedOut,
            });
        }
        if inner.processed.contains_key(&record.fingerprint) {
            return Err(StoreError::UniqueViolation(record.fingerprint));
        }
        inner.processed.insert(record.fingerprint, record.clone());
        Ok(())
    }

    async fn insert_failed(&self, record: &NewFailedRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_transient_failure(&mut inner, "INSERT failed_events")?;
        if inner.failed_insert_failures > 0 {
            inner.failed_insert_failures -= 1;
            return Err(StoreError::QueryError {
                command: "INSERT failed_events",
                error: sqlx::Error::PoolTimedOut,
            });
        }
        inner.failed.push(record.clone());
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_ping {
            return Err(StoreError::QueryError {
                command: "SELECT 1",
                error: sqlx::Error::PoolTimedOut,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Enrichment, EventKind, STATUS_COMPLETED};
    use serde_json::json;

    fn processed_record(fingerprint: Uuid) -> NewProcessedRecord {
        NewProcessedRecord {
            fingerprint,
            kind: EventKind::Purchase,
            subject_id: Some("u1".to_string()),
            occurred_at: Utc::now(),
            properties: HashMap::from([(String::from("amount"), json!(99.99))]),
            processed_at: Utc::now(),
            status: STATUS_COMPLETED.to_string(),
            enrichment: Enrichment {
                worker_id: "worker-1".to_string(),
                processed_at: Utc::now(),
                tag: None,
                session_start: None,
            },
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn raw_insert_enforces_fingerprint_uniqueness() {
        let store = MockStore::new();
        let fingerprint = Uuid::new_v4();

        store
            .insert_raw(fingerprint, &json!({"kind": "custom"}), Utc::now())
            .await
            .unwrap();
        let second = store
            .insert_raw(fingerprint, &json!({"kind": "custom"}), Utc::now())
            .await;

        assert!(matches!(second, Err(StoreError::UniqueViolation(f)) if f == fingerprint));
        assert_eq!(store.raw_count(), 1);
    }

    #[tokio::test]
    async fn processed_insert_loses_race_to_existing_row() {
        let store = MockStore::new();
        let fingerprint = Uuid::new_v4();
        store.seed_processed(processed_record(fingerprint));

        let result = store.insert_processed(&processed_record(fingerprint)).await;
        assert!(matches!(result, Err(StoreError::UniqueViolation(_))));
        assert_eq!(store.processed_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_clear_after_the_injected_window() {
        let store = MockStore::new();
        store.inject_transient_failures(2);

        let first = store.exists_processed(Uuid::new_v4()).await;
        assert!(matches!(first, Err(ref e) if e.is_transient()));
        assert!(store.exists_processed(Uuid::new_v4()).await.is_err());
        assert!(store.exists_processed(Uuid::new_v4()).await.is_ok());
    }

    #[test]
    fn unique_violation_is_not_transient() {
        assert!(!StoreError::UniqueViolation(Uuid::new_v4()).is_transient());
        assert!(StoreError::TimeoutError {
            command: "INSERT processed_events",
            timeout: Duration::from_secs(10),
        }
        .is_transient());
    }
}
