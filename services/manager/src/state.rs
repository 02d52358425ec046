//! Application state shared across request handlers.

use std::sync::Arc;

use crate::store::EventStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn EventStore>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { store }),
        }
    }

    /// Get a reference to the event store.
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }
}
