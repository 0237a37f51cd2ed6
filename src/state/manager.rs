//! # Workflow State Manager
//!
//! Serialized access to per-session workflow state.
//!
//! Every mutation runs under the session's lock from [`SessionLockRegistry`],
//! so a load, mutate and save sequence is atomic with respect to other callers
//! of this manager. Multi-session updates lock in sorted order. Callers that
//! would rather detect contention than wait use [`WorkflowStateManager::update_if_version`].
//!
//! All store calls and lock waits observe the caller's [`CancellationToken`].
//!
//! ```rust
//! use containerflow::orchestration::WorkflowMetrics;
//! use containerflow::state::WorkflowStateManager;
//! use containerflow::store::InMemorySessionStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let manager = WorkflowStateManager::new(
//!     Arc::new(InMemorySessionStore::default()),
//!     Duration::from_secs(30),
//!     Arc::new(WorkflowMetrics::new()),
//! );
//! let cancel = CancellationToken::new();
//!
//! let state = manager
//!     .update("wf_example", &cancel, |state| {
//!         state.repo_path = "/src/app".to_string();
//!         Ok(())
//!     })
//!     .await
//!     .unwrap();
//! assert_eq!(state.repo_path, "/src/app");
//! # });
//! ```

use crate::error::{EngineError, EngineResult};
use crate::logging::log_session_operation;
use crate::models::{DeploymentFailureTracking, Session, WorkflowState};
use crate::orchestration::metrics::WorkflowMetrics;
use crate::state::codec;
use crate::state::lock_registry::{SessionLockGuard, SessionLockRegistry};
use crate::store::{SessionMutator, SessionStore};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Mutation of one session's workflow state inside a batch
pub type WorkflowMutator = Box<dyn FnOnce(&mut WorkflowState) -> EngineResult<()> + Send>;

#[derive(Debug)]
pub struct WorkflowStateManager {
    store: Arc<dyn SessionStore>,
    locks: SessionLockRegistry,
    metrics: Arc<WorkflowMetrics>,
}

impl WorkflowStateManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        lock_timeout: Duration,
        metrics: Arc<WorkflowMetrics>,
    ) -> Self {
        Self {
            store,
            locks: SessionLockRegistry::new(lock_timeout),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn locks(&self) -> &SessionLockRegistry {
        &self.locks
    }

    /// Load the workflow state, creating the session if needed. Undecodable
    /// state yields a fresh record rather than an error.
    pub async fn load(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<WorkflowState> {
        let session = cancellable(cancel, "load", self.store.get_or_create(session_id)).await?;
        Ok(codec::workflow_state_from_session(&session))
    }

    /// Load the workflow state of a session that must already exist
    pub async fn load_existing(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<(WorkflowState, Session)> {
        let session = cancellable(cancel, "load", self.store.get(session_id))
            .await?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        Ok((codec::workflow_state_from_session(&session), session))
    }

    /// Persist `state` under its session id. Does not take the session lock;
    /// callers that read the state first should hold it.
    pub async fn save(
        &self,
        state: &WorkflowState,
        cancel: &CancellationToken,
    ) -> EngineResult<Session> {
        let started = Instant::now();
        let session_id = state.session_id.clone();
        if session_id.is_empty() {
            return Err(EngineError::validation("workflow state has no session id"));
        }

        let encoded = codec::encode(state)?;
        cancellable(cancel, "save", self.store.get_or_create(&session_id)).await?;
        let mutator: SessionMutator = Box::new(move |session| {
            session.metadata.insert(
                crate::constants::metadata_keys::WORKFLOW_STATE.to_string(),
                encoded,
            );
            Ok(())
        });
        let session = cancellable(cancel, "save", self.store.update(&session_id, mutator)).await?;

        log_session_operation(
            "save_workflow_state",
            &session_id,
            "ok",
            Some(started.elapsed().as_millis() as u64),
            None,
        );
        Ok(session)
    }

    pub async fn lock(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<SessionLockGuard> {
        self.locks.acquire(session_id, cancel).await.inspect_err(|e| {
            if matches!(e, EngineError::LockTimeout { .. }) {
                self.metrics.record_lock_timeout();
            }
        })
    }

    /// Run `f` while holding the session's lock. The lock is released on
    /// every exit path, including a panic inside `f`.
    pub async fn with_session_lock<F, Fut, T>(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        f: F,
    ) -> EngineResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let _guard = self.lock(session_id, cancel).await?;
        f().await
    }

    /// Atomic read-modify-write of one session's workflow state.
    ///
    /// If `mutator` fails nothing is saved.
    pub async fn update<F>(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        mutator: F,
    ) -> EngineResult<WorkflowState>
    where
        F: FnOnce(&mut WorkflowState) -> EngineResult<()>,
    {
        let _guard = self.lock(session_id, cancel).await?;
        let mut state = self.load(session_id, cancel).await?;
        mutator(&mut state)?;
        self.save(&state, cancel).await?;
        Ok(state)
    }

    /// Atomic read-modify-write of the raw session record, for metadata the
    /// workflow state does not model
    pub async fn update_session<F>(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
        mutator: F,
    ) -> EngineResult<Session>
    where
        F: FnOnce(&mut Session) -> Result<(), String> + Send + 'static,
    {
        let _guard = self.lock(session_id, cancel).await?;
        cancellable(cancel, "update_session", self.store.get_or_create(session_id)).await?;
        cancellable(
            cancel,
            "update_session",
            self.store.update(session_id, Box::new(mutator)),
        )
        .await
    }

    /// Update several sessions in one call.
    ///
    /// Locks are taken in sorted id order and released in reverse. A session
    /// listed more than once is locked once and its mutators run in submission
    /// order. Every mutator runs before anything is saved, so a failing mutator
    /// leaves all sessions untouched.
    pub async fn batch_update(
        &self,
        updates: Vec<(String, WorkflowMutator)>,
        cancel: &CancellationToken,
    ) -> EngineResult<BTreeMap<String, WorkflowState>> {
        let mut grouped: BTreeMap<String, Vec<WorkflowMutator>> = BTreeMap::new();
        for (session_id, mutator) in updates {
            grouped.entry(session_id).or_default().push(mutator);
        }
        if grouped.is_empty() {
            return Ok(BTreeMap::new());
        }

        let _guards = self
            .locks
            .acquire_many(grouped.keys().cloned().collect::<Vec<String>>(), cancel)
            .await
            .inspect_err(|e| {
                if matches!(e, EngineError::LockTimeout { .. }) {
                    self.metrics.record_lock_timeout();
                }
            })?;

        let loaded =
            try_join_all(grouped.keys().map(|session_id| self.load(session_id, cancel))).await?;

        let mut results = BTreeMap::new();
        for ((session_id, mutators), mut state) in grouped.into_iter().zip(loaded) {
            for mutator in mutators {
                mutator(&mut state)?;
            }
            results.insert(session_id, state);
        }

        try_join_all(results.values().map(|state| self.save(state, cancel))).await?;

        debug!(sessions = results.len(), "Batch update committed");
        Ok(results)
    }

    /// Apply `mutator` only if the session is still at `expected_version`.
    ///
    /// The version is the session's `updated_at`. This never waits: if another
    /// caller holds the session lock, or the version moved, it fails at once
    /// with [`EngineError::ConcurrencyConflict`]. The check and the write happen
    /// in one atomic store update.
    pub async fn update_if_version<F>(
        &self,
        session_id: &str,
        expected_version: DateTime<Utc>,
        cancel: &CancellationToken,
        mutator: F,
    ) -> EngineResult<(WorkflowState, Session)>
    where
        F: FnOnce(&mut WorkflowState) -> EngineResult<()> + Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(EngineError::cancelled("update_if_version"));
        }
        let Some(_guard) = self.locks.try_acquire(session_id) else {
            let actual = cancellable(cancel, "update_if_version", self.store.get(session_id))
                .await?
                .map_or(expected_version, |session| session.version());
            self.metrics.record_concurrency_conflict();
            warn!(session_id = %session_id, "Optimistic update rejected, session is locked");
            return Err(EngineError::ConcurrencyConflict {
                session_id: session_id.to_string(),
                expected: expected_version,
                actual,
            });
        };

        let outcome: Arc<parking_lot::Mutex<Option<EngineError>>> =
            Arc::new(parking_lot::Mutex::new(None));
        let outcome_slot = Arc::clone(&outcome);
        let id = session_id.to_string();

        let store_mutator: SessionMutator = Box::new(move |session| {
            let fail = |error: EngineError| {
                let message = error.to_string();
                *outcome_slot.lock() = Some(error);
                Err(message)
            };

            if session.version() != expected_version {
                return fail(EngineError::ConcurrencyConflict {
                    session_id: id,
                    expected: expected_version,
                    actual: session.version(),
                });
            }

            let mut state = codec::workflow_state_from_session(session);
            if let Err(e) = mutator(&mut state) {
                return fail(e);
            }
            match codec::store_workflow_state(session, &state) {
                Ok(()) => Ok(()),
                Err(e) => fail(e),
            }
        });

        let result = cancellable(
            cancel,
            "update_if_version",
            self.store.update(session_id, store_mutator),
        )
        .await;

        match result {
            Ok(session) => Ok((codec::workflow_state_from_session(&session), session)),
            Err(e) => {
                let error = outcome.lock().take().unwrap_or(e);
                if matches!(error, EngineError::ConcurrencyConflict { .. }) {
                    self.metrics.record_concurrency_conflict();
                    warn!(session_id = %session_id, error = %error, "Optimistic update rejected");
                }
                Err(error)
            }
        }
    }

    /// Current deploy failure tracking for a session (empty if none recorded)
    pub async fn failure_tracking(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<DeploymentFailureTracking> {
        let session = cancellable(cancel, "failure_tracking", self.store.get(session_id))
            .await?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        Ok(codec::failure_tracking_from_session(&session))
    }

    pub async fn save_failure_tracking(
        &self,
        session_id: &str,
        tracking: &DeploymentFailureTracking,
        cancel: &CancellationToken,
    ) -> EngineResult<Session> {
        let encoded = codec::encode(tracking)?;
        cancellable(cancel, "save_failure_tracking", self.store.get_or_create(session_id)).await?;
        let mutator: SessionMutator = Box::new(move |session| {
            session.metadata.insert(
                crate::constants::metadata_keys::DEPLOYMENT_FAILURE_TRACKING.to_string(),
                encoded,
            );
            Ok(())
        });
        cancellable(
            cancel,
            "save_failure_tracking",
            self.store.update(session_id, mutator),
        )
        .await
    }

    /// Remove unreferenced locks of sessions the store no longer lists
    pub async fn cleanup_locks(&self) -> EngineResult<usize> {
        let live: HashSet<String> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|session| session.id)
            .collect();
        let removed = self.locks.sweep(&live);
        if removed > 0 {
            info!(removed, remaining = self.locks.len(), "Swept idle session locks");
        }
        Ok(removed)
    }

    /// Run [`Self::cleanup_locks`] every `interval` until `cancel` fires
    pub fn spawn_lock_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Lock cleanup stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = manager.cleanup_locks().await {
                            warn!(error = %e, "Lock cleanup sweep failed");
                        }
                    }
                }
            }
        })
    }
}

/// Await a store call unless `cancel` fires first
async fn cancellable<T, E, Fut>(
    cancel: &CancellationToken,
    operation: &str,
    fut: Fut,
) -> EngineResult<T>
where
    Fut: Future<Output = Result<T, E>>,
    EngineError: From<E>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::cancelled(operation)),
        result = fut => result.map_err(EngineError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{steps, WorkflowStatus};
    use crate::store::InMemorySessionStore;

    fn mutator(
        f: impl FnOnce(&mut WorkflowState) -> EngineResult<()> + Send + 'static,
    ) -> WorkflowMutator {
        Box::new(f)
    }

    fn manager() -> WorkflowStateManager {
        WorkflowStateManager::new(
            Arc::new(InMemorySessionStore::default()),
            Duration::from_secs(5),
            Arc::new(WorkflowMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_load_creates_fresh_state() {
        let manager = manager();
        let cancel = CancellationToken::new();
        let state = manager.load("wf_new", &cancel).await.unwrap();
        assert_eq!(state.session_id, "wf_new");
        assert_eq!(state.status, WorkflowStatus::Initialized);
        assert!(manager.store().get("wf_new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_load_existing_requires_session() {
        let manager = manager();
        let err = manager
            .load_existing("wf_missing", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_persists_mutation() {
        let manager = manager();
        let cancel = CancellationToken::new();
        manager
            .update("wf_a", &cancel, |state| {
                state.mark_step_completed(steps::ANALYZE_REPOSITORY);
                Ok(())
            })
            .await
            .unwrap();

        let reloaded = manager.load("wf_a", &cancel).await.unwrap();
        assert!(reloaded.is_step_completed(steps::ANALYZE_REPOSITORY));
        assert!(manager.locks().is_empty());
    }

    #[tokio::test]
    async fn test_failed_mutator_saves_nothing() {
        let manager = manager();
        let cancel = CancellationToken::new();
        let result = manager
            .update("wf_a", &cancel, |state| {
                state.repo_path = "/tmp/should-not-stick".to_string();
                Err(EngineError::validation("rejected"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(manager.load("wf_a", &cancel).await.unwrap().repo_path, "");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let manager = manager();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager.load("wf_a", &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_update_if_version_detects_stale_version() {
        let manager = manager();
        let cancel = CancellationToken::new();
        manager.load("wf_a", &cancel).await.unwrap();
        let session = manager.store().get("wf_a").await.unwrap().unwrap();
        let version = session.version();

        let (state, updated) = manager
            .update_if_version("wf_a", version, &cancel, |state| {
                state.repo_path = "/src/one".to_string();
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(state.repo_path, "/src/one");
        assert!(updated.version() > version);

        let err = manager
            .update_if_version("wf_a", version, &cancel, |state| {
                state.repo_path = "/src/two".to_string();
                Ok(())
            })
            .await
            .unwrap_err();
        match err {
            EngineError::ConcurrencyConflict { expected, actual, .. } => {
                assert_eq!(expected, version);
                assert_eq!(actual, updated.version());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(manager.load("wf_a", &cancel).await.unwrap().repo_path, "/src/one");
    }

    #[tokio::test]
    async fn test_update_if_version_does_not_wait_for_held_lock() {
        let manager = WorkflowStateManager::new(
            Arc::new(InMemorySessionStore::default()),
            Duration::from_secs(30),
            Arc::new(WorkflowMetrics::new()),
        );
        let cancel = CancellationToken::new();
        manager.load("wf_v", &cancel).await.unwrap();
        let version = manager.store().get("wf_v").await.unwrap().unwrap().version();
        let _held = manager.lock("wf_v", &cancel).await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_millis(500),
            manager.update_if_version("wf_v", version, &cancel, |state| {
                state.repo_path = "/src/late".to_string();
                Ok(())
            }),
        )
        .await
        .expect("optimistic update waited for the lock");

        match result {
            Err(EngineError::ConcurrencyConflict { expected, actual, .. }) => {
                assert_eq!(expected, version);
                assert_eq!(actual, version);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(manager.metrics.snapshot().concurrency_conflicts, 1);
        assert!(manager.locks().contains("wf_v"));
    }

    #[tokio::test]
    async fn test_batch_update_dedupes_and_orders_mutators() {
        let manager = manager();
        let cancel = CancellationToken::new();
        let updates: Vec<(String, WorkflowMutator)> = vec![
            (
                "wf_b".to_string(),
                mutator(|s: &mut WorkflowState| {
                    s.current_step = "first".to_string();
                    Ok(())
                }),
            ),
            (
                "wf_a".to_string(),
                mutator(|s: &mut WorkflowState| {
                    s.repo_path = "/a".to_string();
                    Ok(())
                }),
            ),
            (
                "wf_b".to_string(),
                mutator(|s: &mut WorkflowState| {
                    s.current_step = format!("{}+second", s.current_step);
                    Ok(())
                }),
            ),
        ];

        let results = manager.batch_update(updates, &cancel).await.unwrap();
        assert_eq!(results.keys().collect::<Vec<_>>(), vec!["wf_a", "wf_b"]);
        assert_eq!(
            manager.load("wf_b", &cancel).await.unwrap().current_step,
            "first+second"
        );
    }

    #[tokio::test]
    async fn test_batch_update_failure_saves_nothing() {
        let manager = manager();
        let cancel = CancellationToken::new();
        let updates: Vec<(String, WorkflowMutator)> = vec![
            (
                "wf_a".to_string(),
                mutator(|s: &mut WorkflowState| {
                    s.repo_path = "/a".to_string();
                    Ok(())
                }),
            ),
            (
                "wf_b".to_string(),
                mutator(|_: &mut WorkflowState| Err(EngineError::validation("bad"))),
            ),
        ];
        assert!(manager.batch_update(updates, &cancel).await.is_err());
        assert_eq!(manager.load("wf_a", &cancel).await.unwrap().repo_path, "");
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_idle_locks_of_dead_sessions() {
        let manager = manager();
        let cancel = CancellationToken::new();
        manager.load("wf_live", &cancel).await.unwrap();
        let _held = manager.lock("wf_gone", &cancel).await.unwrap();

        assert_eq!(manager.cleanup_locks().await.unwrap(), 0);
        assert!(manager.locks().contains("wf_gone"));
    }
}
