//! Session store wrapper that rejects writes on demand.

use async_trait::async_trait;
use containerflow::error::{StoreError, StoreResult};
use containerflow::models::Session;
use containerflow::store::{SessionMutator, SessionStore, StoreStats};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    None,
    /// Every `update` fails
    All,
    /// Only updates that change this metadata key fail
    Touching(&'static str),
}

#[derive(Debug)]
pub struct FailingStore {
    inner: Arc<dyn SessionStore>,
    mode: Mutex<WriteFailure>,
    rejected: AtomicU32,
}

impl FailingStore {
    pub fn wrap(inner: Arc<dyn SessionStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            mode: Mutex::new(WriteFailure::None),
            rejected: AtomicU32::new(0),
        })
    }

    pub fn fail_writes(&self, mode: WriteFailure) {
        *self.mode.lock() = mode;
    }

    /// Number of updates refused so far
    pub fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::SeqCst)
    }

    fn reject(&self, session_id: &str) -> StoreError {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        StoreError::backend("update", format!("write refused for {session_id}"))
    }
}

#[async_trait]
impl SessionStore for FailingStore {
    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>> {
        self.inner.get(session_id).await
    }

    async fn create(&self, session: Session) -> StoreResult<Session> {
        self.inner.create(session).await
    }

    async fn get_or_create(&self, session_id: &str) -> StoreResult<Session> {
        self.inner.get_or_create(session_id).await
    }

    async fn update(&self, session_id: &str, mutator: SessionMutator) -> StoreResult<Session> {
        let mode = *self.mode.lock();
        match mode {
            WriteFailure::None => self.inner.update(session_id, mutator).await,
            WriteFailure::All => Err(self.reject(session_id)),
            WriteFailure::Touching(key) => {
                let Some(mut draft) = self.inner.get(session_id).await? else {
                    return Err(StoreError::NotFound(session_id.to_string()));
                };
                let before = draft.metadata.get(key).cloned();
                mutator(&mut draft).map_err(StoreError::Rejected)?;
                if draft.metadata.get(key) != before.as_ref() {
                    return Err(self.reject(session_id));
                }
                self.inner
                    .update(
                        session_id,
                        Box::new(move |session| {
                            session.metadata = draft.metadata;
                            session.labels = draft.labels;
                            Ok(())
                        }),
                    )
                    .await
            }
        }
    }

    async fn delete(&self, session_id: &str) -> StoreResult<bool> {
        self.inner.delete(session_id).await
    }

    async fn list(&self) -> StoreResult<Vec<Session>> {
        self.inner.list().await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats().await
    }

    async fn close(&self) -> StoreResult<()> {
        self.inner.close().await
    }
}
