//! Shared helpers for integration tests.
#![allow(dead_code)]

pub mod executors;
pub mod failing_store;
pub mod strategies;

use containerflow::config::EngineConfig;
use containerflow::orchestration::{StepRegistry, WorkflowCoordinator, WorkflowMetrics};
use containerflow::state::WorkflowStateManager;
use containerflow::store::{InMemorySessionStore, SessionStore};
use std::sync::Arc;
use std::time::Duration;

pub use executors::*;

pub fn memory_store() -> Arc<dyn SessionStore> {
    Arc::new(InMemorySessionStore::default())
}

pub fn state_manager(lock_timeout: Duration) -> Arc<WorkflowStateManager> {
    Arc::new(WorkflowStateManager::new(
        memory_store(),
        lock_timeout,
        Arc::new(WorkflowMetrics::new()),
    ))
}

pub fn coordinator_with(steps: StepRegistry) -> WorkflowCoordinator {
    coordinator_on(memory_store(), steps)
}

pub fn coordinator_on(store: Arc<dyn SessionStore>, steps: StepRegistry) -> WorkflowCoordinator {
    let mut config = EngineConfig::default();
    config.locking.acquire_timeout_ms = 5_000;
    WorkflowCoordinator::new(store, steps, &config, Arc::new(WorkflowMetrics::new()))
}
