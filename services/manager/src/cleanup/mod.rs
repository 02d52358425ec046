//! Physical removal of expired events.
//!
//! Reads already hide expired events; this worker reclaims their storage.

mod worker;

pub use worker::{ExpiryWorker, ExpiryWorkerConfig};
