//! # Durable Session Store
//!
//! The persistence contract the engine consumes. Backends own session
//! records, TTL and per-record atomicity; the engine only reads records and
//! mutates them through [`SessionStore::update`].
//!
//! Backends:
//! - [`InMemorySessionStore`]: process-local, used by tests and single-node setups
//! - [`PostgresSessionStore`]: durable, behind the `postgres` feature

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::config::{EngineConfig, StoreBackend};
use crate::error::{EngineError, EngineResult, StoreResult};
use crate::models::Session;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

pub use memory::InMemorySessionStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresSessionStore;

/// Mutation applied to a stored record. Returning `Err` leaves the record untouched
/// and surfaces as [`crate::error::StoreError::Rejected`].
pub type SessionMutator = Box<dyn FnOnce(&mut Session) -> Result<(), String> + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub expired_sessions: usize,
}

#[async_trait]
pub trait SessionStore: Send + Sync + Debug {
    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>>;

    /// Insert a new record; fails with `AlreadyExists` if the id is taken
    async fn create(&self, session: Session) -> StoreResult<Session>;

    /// Return the existing record or atomically create an active one
    async fn get_or_create(&self, session_id: &str) -> StoreResult<Session>;

    /// Apply `mutator` atomically and bump `updated_at`
    async fn update(&self, session_id: &str, mutator: SessionMutator) -> StoreResult<Session>;

    async fn delete(&self, session_id: &str) -> StoreResult<bool>;

    /// Non-expired sessions
    async fn list(&self) -> StoreResult<Vec<Session>>;

    async fn stats(&self) -> StoreResult<StoreStats>;

    async fn close(&self) -> StoreResult<()>;
}

/// Build the backend selected in configuration
pub async fn connect(config: &EngineConfig) -> EngineResult<Arc<dyn SessionStore>> {
    let ttl = config.session.ttl();
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemorySessionStore::new(ttl))),
        #[cfg(feature = "postgres")]
        StoreBackend::Postgres => {
            let url = config.store.database_url.as_deref().ok_or_else(|| {
                EngineError::Configuration("store.database_url is not set".to_string())
            })?;
            let store = PostgresSessionStore::connect(url, config.store.max_connections, ttl)
                .await
                .map_err(EngineError::from)?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreBackend::Postgres => Err(EngineError::Configuration(
            "postgres backend requested but the `postgres` feature is disabled".to_string(),
        )),
    }
}
