//! Reconciler error types.

use thiserror::Error;

use crate::shadow::ShadowError;
use crate::store::StoreError;

/// Errors from a sync operation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The request was malformed; nothing was attempted.
    #[error("invalid sync request: {0}")]
    Validation(String),

    /// The hub failed in a way that may clear up; retrying is safe.
    #[error("transient hub failure: {0}")]
    Transient(#[source] ShadowError),

    /// The hub refused the request; retrying will not help.
    #[error("hub rejected sync: {0}")]
    Permanent(#[source] ShadowError),

    /// The device does not exist on the hub.
    #[error("device not found on hub: {0}")]
    NotFound(String),

    /// The caller's deadline passed or it cancelled the operation.
    #[error("sync cancelled")]
    Cancelled,

    /// The hub call succeeded but the event could not be recorded.
    #[error("failed to record event: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transient(_) | SyncError::Cancelled => true,
            SyncError::Store(err) => !err.is_duplicate(),
            SyncError::Validation(_) | SyncError::Permanent(_) | SyncError::NotFound(_) => false,
        }
    }
}

impl From<ShadowError> for SyncError {
    fn from(err: ShadowError) -> Self {
        match err {
            ShadowError::NotFound(device) => SyncError::NotFound(device),
            err if err.is_transient() => SyncError::Transient(err),
            err => SyncError::Permanent(err),
        }
    }
}
