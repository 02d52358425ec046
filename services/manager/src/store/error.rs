//! Event store error types.

use shadowsync_events::EventError;
use shadowsync_id::EventId;
use thiserror::Error;

use crate::db::DbError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Event store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An event with this ID was already appended.
    #[error("event {0} already exists")]
    DuplicateKey(EventId),

    /// No visible event with this ID exists for the tenant.
    #[error("event {0} not found")]
    NotFound(EventId),

    /// The event could not be encoded for storage.
    #[error("invalid event: {0}")]
    Invalid(#[from] EventError),

    /// A stored row could not be decoded.
    #[error("stored event {id} is corrupt: {message}")]
    Corrupt { id: String, message: String },

    /// Backend failure.
    #[error(transparent)]
    Database(#[from] DbError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}
