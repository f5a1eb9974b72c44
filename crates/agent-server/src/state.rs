//! Application State

use std::sync::Arc;

use agent_core::{FanoutDispatcher, MemoryRunStore, RunCoordinator};

use crate::catalog::Catalog;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Agents, model endpoints and HTTP tools
    pub catalog: Arc<Catalog>,

    /// Single-turn execution, persisting into `store`
    pub coordinator: RunCoordinator,

    /// Same turn against several models at once
    pub dispatcher: Arc<FanoutDispatcher>,

    /// Terminal runs, readable by id
    pub store: Arc<MemoryRunStore>,
}

impl AppState {
    /// Wire the coordinator's sink to `store` and build the dispatcher on top.
    pub fn new(catalog: Catalog, coordinator: RunCoordinator, store: Arc<MemoryRunStore>) -> Self {
        let coordinator = coordinator.with_sink(store.clone());
        let dispatcher = Arc::new(FanoutDispatcher::new(coordinator.clone()));
        Self {
            catalog: Arc::new(catalog),
            coordinator,
            dispatcher,
            store,
        }
    }
}
