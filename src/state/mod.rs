//! # Workflow State
//!
//! Persistence and concurrency control for per-session workflow state:
//! the metadata codec, the session lock registry and the manager that
//! combines them with a [`crate::store::SessionStore`].

pub mod codec;
pub mod lock_registry;
pub mod manager;

pub use lock_registry::{MultiSessionGuard, SessionLockGuard, SessionLockRegistry};
pub use manager::{WorkflowMutator, WorkflowStateManager};
