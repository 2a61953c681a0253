use eventflow_common::store::StoreError;
use thiserror::Error;

/// Classification of a failure encountered while an entry moves through the
/// processing state machine.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// A kind-specific rule was violated. Permanent: the event is
    /// dead-lettered without retries.
    #[error("{0}")]
    Validation(String),

    /// The store misbehaved. Transient: the persist step retries with
    /// backoff and dead-letters only on exhaustion.
    #[error(transparent)]
    Store(#[from] StoreError),
}
