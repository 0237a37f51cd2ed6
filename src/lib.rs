#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! # Containerflow Core
//!
//! Workflow-state and failure-recovery engine for the containerization
//! pipeline (analyze, Dockerfile, build, scan, tag, push, manifests, cluster,
//! deploy, verify).
//!
//! ## Overview
//!
//! Each pipeline run is a session in a durable store. The engine keeps a
//! typed [`models::WorkflowState`] in the session's metadata, serializes
//! mutations per session, and turns step failures into structured advice:
//! whether the step is worth retrying and after what delay, and which
//! corrective step to run instead. It never retries on its own.
//!
//! ## Module Organization
//!
//! - [`store`] - Durable session store contract with in-memory and Postgres backends
//! - [`models`] - Sessions, workflow state, artifacts and failure tracking
//! - [`state`] - Metadata codec, session locks and the state manager
//! - [`orchestration`] - Step sequence, retry advice, redirects and the coordinator
//! - [`config`] - Layered YAML and environment configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured `tracing` setup and helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use containerflow::config::EngineConfig;
//! use containerflow::orchestration::{StepRegistry, StepRequest, WorkflowCoordinator};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let coordinator = WorkflowCoordinator::bootstrap(&config, StepRegistry::new()).await?;
//! let cancel = CancellationToken::new();
//!
//! let start = coordinator.start_workflow("/src/app", Vec::new(), &cancel).await?;
//! let request = StepRequest::new("analyze_repository", &start.session_id)
//!     .with_param("repo_path", "/src/app");
//! let outcome = coordinator.execute_step(request, &cancel).await?;
//! println!("succeeded: {}", outcome.is_success());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod state;
pub mod store;

pub use config::{ConfigManager, EngineConfig};
pub use constants::{StepStatus, WorkflowStatus};
pub use error::{EngineError, EngineResult, StoreError, StoreResult};
pub use models::{Session, SessionStatus, WorkflowState};
pub use orchestration::{
    RetryAdvice, StepOutcome, StepRequest, WorkflowCoordinator, WorkflowMetrics,
};
pub use state::WorkflowStateManager;
pub use store::{InMemorySessionStore, SessionStore};
