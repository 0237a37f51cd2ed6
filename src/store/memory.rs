//! In-memory session store backed by a sharded concurrent map.

use super::{SessionMutator, SessionStore, StoreStats};
use crate::error::{StoreError, StoreResult};
use crate::models::Session;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
    closed: AtomicBool,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>> {
        self.ensure_open()?;
        Ok(self.sessions.get(session_id).map(|s| s.value().clone()))
    }

    async fn create(&self, session: Session) -> StoreResult<Session> {
        self.ensure_open()?;
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(session.id)),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    async fn get_or_create(&self, session_id: &str) -> StoreResult<Session> {
        self.ensure_open()?;
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %session_id, "Creating session");
                Session::new(session_id, self.ttl)
            });
        Ok(entry.value().clone())
    }

    async fn update(&self, session_id: &str, mutator: SessionMutator) -> StoreResult<Session> {
        self.ensure_open()?;
        // the shard write lock is held for the whole read-modify-write
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        let mut draft = entry.value().clone();
        mutator(&mut draft).map_err(StoreError::Rejected)?;
        draft.id = session_id.to_string();
        draft.updated_at = entry.value().updated_at;
        draft.touch();

        *entry.value_mut() = draft.clone();
        Ok(draft)
    }

    async fn delete(&self, session_id: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        Ok(self.sessions.remove(session_id).is_some())
    }

    async fn list(&self) -> StoreResult<Vec<Session>> {
        self.ensure_open()?;
        let now = Utc::now();
        Ok(self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_expired_at(now))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut stats = StoreStats::default();
        for entry in self.sessions.iter() {
            stats.total_sessions += 1;
            if entry.value().is_expired_at(now) {
                stats.expired_sessions += 1;
            } else {
                stats.active_sessions += 1;
            }
        }
        Ok(stats)
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
