use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Failures surfaced by the document-store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum StoreError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient failures may be retried for idempotent operations and are
    /// otherwise absorbed as a stale indicator; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Typed outcome of a state-changing operation, always returned to the
/// caller rather than thrown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("payload rejected: {0}")]
    PayloadRejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable after {attempts} attempt(s): {message}")]
    Unavailable { attempts: u32, message: String },
}

impl MutationError {
    pub fn from_store(err: StoreError, attempts: u32) -> Self {
        match err {
            StoreError::PermissionDenied(msg) => MutationError::PermissionDenied(msg),
            StoreError::NotFound(msg) => MutationError::NotFound(msg),
            StoreError::Conflict(msg) => MutationError::Conflict(msg),
            StoreError::Validation(msg) => MutationError::PayloadRejected(msg),
            StoreError::Unavailable(message) => MutationError::Unavailable { attempts, message },
        }
    }
}

/// Error taxonomy of the synchronization core.
///
/// `Config` halts dependent operations, `Subscription` is absorbed into a
/// stale flag, `Mutation` is returned to the caller, `ReconcileTimeout` is
/// emitted as an event while the optimistic entry stays visible as failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("subscription lost: {0}")]
    Subscription(String),
    #[error("stream is not live: {0}")]
    StreamClosed(String),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("no server echo for optimistic write {correlation_id} within {timeout_ms}ms")]
    ReconcileTimeout {
        correlation_id: Uuid,
        timeout_ms: u64,
    },
}
