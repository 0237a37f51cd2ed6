//! # Session Lock Registry
//!
//! One async mutex per session id, created on first use and shared through a
//! sharded concurrent map so the registry itself is not a point of contention.
//!
//! Entries are reference counted through their `Arc`: the map holds one
//! reference and every holder or waiter holds another. A released guard
//! removes the entry when the map's reference is the only one left, and the
//! periodic sweep only ever removes entries in that same state, so a lock that
//! is held or awaited is never dropped from the registry.
//!
//! Acquisition is bounded by a timeout and observes a [`CancellationToken`].
//! [`SessionLockRegistry::try_acquire`] never waits.

use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug)]
pub struct SessionLockRegistry {
    locks: Arc<LockMap>,
    acquire_timeout: Duration,
}

impl SessionLockRegistry {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            acquire_timeout,
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    /// Wait for exclusive access to `session_id`
    pub async fn acquire(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<SessionLockGuard> {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::cancelled(format!("lock {session_id}"))),
            acquired = tokio::time::timeout(self.acquire_timeout, Arc::clone(&lock).lock_owned()) => {
                acquired.map_err(|_| EngineError::LockTimeout {
                    session_id: session_id.to_string(),
                    waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                })
            }
        };
        drop(lock);

        match outcome {
            Ok(guard) => {
                debug!(
                    session_id = %session_id,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Session lock acquired"
                );
                Ok(SessionLockGuard {
                    session_id: session_id.to_string(),
                    guard: Some(guard),
                    locks: Arc::clone(&self.locks),
                })
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Session lock not acquired");
                prune_if_unreferenced(&self.locks, session_id);
                Err(e)
            }
        }
    }

    /// Take the lock only if nobody holds it. `None` means the session is busy.
    pub fn try_acquire(&self, session_id: &str) -> Option<SessionLockGuard> {
        let lock = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let attempt = Arc::clone(&lock).try_lock_owned();
        drop(lock);

        match attempt {
            Ok(guard) => Some(SessionLockGuard {
                session_id: session_id.to_string(),
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
            }),
            Err(_) => {
                debug!(session_id = %session_id, "Session lock busy");
                prune_if_unreferenced(&self.locks, session_id);
                None
            }
        }
    }

    /// Lock several sessions without risk of deadlock.
    ///
    /// Ids are deduplicated and acquired in lexicographic order, so any two
    /// callers with overlapping sets contend on the same first lock instead of
    /// forming a cycle. On failure every lock taken so far is released.
    pub async fn acquire_many<I, S>(
        &self,
        session_ids: I,
        cancel: &CancellationToken,
    ) -> EngineResult<MultiSessionGuard>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ordered: BTreeSet<String> = session_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();

        let mut held = MultiSessionGuard {
            guards: Vec::with_capacity(ordered.len()),
        };
        for session_id in &ordered {
            // on error `held` drops and releases in reverse order
            let guard = self.acquire(session_id, cancel).await?;
            held.guards.push(guard);
        }
        Ok(held)
    }

    /// Drop unreferenced locks whose session is not in `live_sessions`
    pub fn sweep(&self, live_sessions: &HashSet<String>) -> usize {
        let candidates: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| !live_sessions.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        candidates
            .iter()
            .filter(|id| prune_if_unreferenced(&self.locks, id))
            .count()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.locks.contains_key(session_id)
    }
}

fn prune_if_unreferenced(locks: &LockMap, session_id: &str) -> bool {
    locks
        .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1)
        .is_some()
}

/// Exclusive access to one session; released on drop
#[derive(Debug)]
pub struct SessionLockGuard {
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl SessionLockGuard {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        // release the mutex first so its Arc no longer counts as a reference
        drop(self.guard.take());
        prune_if_unreferenced(&self.locks, &self.session_id);
    }
}

/// Locks taken by [`SessionLockRegistry::acquire_many`], released in reverse order
#[derive(Debug)]
pub struct MultiSessionGuard {
    guards: Vec<SessionLockGuard>,
}

impl MultiSessionGuard {
    /// Session ids in acquisition order
    pub fn session_ids(&self) -> Vec<&str> {
        self.guards.iter().map(|g| g.session_id()).collect()
    }
}

impl Drop for MultiSessionGuard {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionLockRegistry {
        SessionLockRegistry::new(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let registry = registry();
        let cancel = CancellationToken::new();
        {
            let guard = registry.acquire("wf_a", &cancel).await.unwrap();
            assert_eq!(guard.session_id(), "wf_a");
            assert!(registry.contains("wf_a"));
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_while_held() {
        let registry = registry();
        let cancel = CancellationToken::new();
        let _held = registry.acquire("wf_a", &cancel).await.unwrap();

        let err = registry.acquire("wf_a", &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::LockTimeout { .. }));
        // the holder's entry survives the failed waiter
        assert!(registry.contains("wf_a"));
    }

    #[tokio::test]
    async fn test_cancelled_acquire_returns_promptly() {
        let registry = SessionLockRegistry::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let _held = registry.acquire("wf_a", &cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        waiter_cancel.cancel();
        let err = registry.acquire("wf_a", &waiter_cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_try_acquire_does_not_wait() {
        let registry = SessionLockRegistry::new(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let held = registry.acquire("wf_a", &cancel).await.unwrap();

        assert!(registry.try_acquire("wf_a").is_none());
        assert!(registry.contains("wf_a"));

        drop(held);
        let guard = registry.try_acquire("wf_a").unwrap();
        assert_eq!(guard.session_id(), "wf_a");
        drop(guard);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_many_orders_and_dedupes() {
        let registry = registry();
        let cancel = CancellationToken::new();
        let guard = registry
            .acquire_many(["wf_c", "wf_a", "wf_b", "wf_a"], &cancel)
            .await
            .unwrap();
        assert_eq!(guard.session_ids(), vec!["wf_a", "wf_b", "wf_c"]);
        drop(guard);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_many_releases_on_failure() {
        let registry = registry();
        let cancel = CancellationToken::new();
        let _held = registry.acquire("wf_b", &cancel).await.unwrap();

        let result = registry.acquire_many(["wf_a", "wf_b"], &cancel).await;
        assert!(result.is_err());
        assert!(!registry.contains("wf_a"));
    }

    #[tokio::test]
    async fn test_sweep_skips_held_and_live_locks() {
        let registry = registry();
        let cancel = CancellationToken::new();
        let _held = registry.acquire("wf_dead_but_held", &cancel).await.unwrap();

        let live: HashSet<String> = HashSet::new();
        assert_eq!(registry.sweep(&live), 0);
        assert!(registry.contains("wf_dead_but_held"));
    }
}
