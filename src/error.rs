//! Error types for the workflow engine.
//!
//! [`EngineError`] is the taxonomy callers see. [`StoreError`] is the narrower
//! contract of the durable session store and converts into it.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Bad or missing input; no state was touched
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },
    /// The external step failed. Expected outcome, routed to redirect logic
    #[error("Step {step} failed: {message}")]
    StepExecution { step: String, message: String },
    #[error("Persistence error during {operation}: {reason}")]
    Persistence { operation: String, reason: String },
    #[error(
        "Concurrency conflict for session {session_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        session_id: String,
        expected: DateTime<Utc>,
        actual: DateTime<Utc>,
    },
    #[error("No redirect configured for step {step}")]
    RedirectNotConfigured { step: String },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Timed out after {waited_ms}ms waiting for lock on session {session_id}")]
    LockTimeout { session_id: String, waited_ms: u64 },
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn persistence(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Persistence {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Whether this error came from the durable store rather than the caller or the step
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(error: serde_json::Error) -> Self {
        EngineError::Serialization(format!("JSON serialization error: {error}"))
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(error: config::ConfigError) -> Self {
        EngineError::Configuration(error.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Errors produced by [`crate::store::SessionStore`] implementations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Session {0} not found")]
    NotFound(String),
    #[error("Session {0} already exists")]
    AlreadyExists(String),
    #[error("Store backend error during {operation}: {reason}")]
    Backend { operation: String, reason: String },
    #[error("Store serialization error: {0}")]
    Serialization(String),
    /// A mutator passed to `update` rejected the record
    #[error("Update rejected: {0}")]
    Rejected(String),
    #[error("Store is closed")]
    Closed,
}

impl StoreError {
    pub fn backend(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serialization(error.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => StoreError::NotFound("<unknown>".to_string()),
            other => StoreError::backend("sql", other),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(session_id) => EngineError::SessionNotFound { session_id },
            StoreError::Serialization(reason) => EngineError::Serialization(reason),
            other => EngineError::persistence("store", other),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
