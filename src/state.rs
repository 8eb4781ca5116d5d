//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::store::Store;
use crate::task::Scheduler;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Metadata store (PostgreSQL, or in-memory in development)
    pub store: Arc<dyn Store>,

    /// Scheduler handle, for live executor status
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, scheduler: Scheduler) -> Self {
        Self { store, scheduler }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
