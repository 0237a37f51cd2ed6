//! PostgreSQL session store.
//!
//! One row per session; labels and metadata are JSONB. `update` runs inside a
//! transaction holding `SELECT ... FOR UPDATE` on the row, so concurrent
//! writers to the same session serialize in the database.

use super::{SessionMutator, SessionStore, StoreStats};
use crate::error::{StoreError, StoreResult};
use crate::models::{Session, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    status: String,
    labels: Json<HashMap<String, String>>,
    metadata: Json<HashMap<String, serde_json::Value>>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            expires_at: row.expires_at,
            status: SessionStatus::parse(&row.status).unwrap_or_default(),
            labels: row.labels.0,
            metadata: row.metadata.0,
        }
    }
}

const SELECT_COLUMNS: &str =
    "id, created_at, updated_at, expires_at, status, labels, metadata";

#[derive(Debug, Clone)]
pub struct PostgresSessionStore {
    pool: PgPool,
    ttl: Duration,
    closed: std::sync::Arc<AtomicBool>,
}

impl PostgresSessionStore {
    /// Connect, then run pending migrations
    pub async fn connect(database_url: &str, max_connections: u32, ttl: Duration) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| StoreError::backend("migrate", e))?;
        info!(max_connections, "Connected Postgres session store");
        Ok(Self::from_pool(pool, ttl))
    }

    pub fn from_pool(pool: PgPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            closed: std::sync::Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    async fn insert(&self, session: &Session, on_conflict_nothing: bool) -> StoreResult<bool> {
        let sql = if on_conflict_nothing {
            "INSERT INTO containerflow_sessions \
             (id, created_at, updated_at, expires_at, status, labels, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (id) DO NOTHING"
        } else {
            "INSERT INTO containerflow_sessions \
             (id, created_at, updated_at, expires_at, status, labels, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)"
        };

        let result = sqlx::query(sql)
            .bind(&session.id)
            .bind(session.created_at)
            .bind(session.updated_at)
            .bind(session.expires_at)
            .bind(session.status.as_str())
            .bind(Json(&session.labels))
            .bind(Json(&session.metadata))
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::AlreadyExists(session.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn get(&self, session_id: &str) -> StoreResult<Option<Session>> {
        self.ensure_open()?;
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM containerflow_sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Session::from))
    }

    async fn create(&self, session: Session) -> StoreResult<Session> {
        self.ensure_open()?;
        self.insert(&session, false).await?;
        Ok(session)
    }

    async fn get_or_create(&self, session_id: &str) -> StoreResult<Session> {
        self.ensure_open()?;
        let fresh = Session::new(session_id, self.ttl);
        if self.insert(&fresh, true).await? {
            debug!(session_id = %session_id, "Created session");
            return Ok(fresh);
        }
        self.get(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn update(&self, session_id: &str, mutator: SessionMutator) -> StoreResult<Session> {
        self.ensure_open()?;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM containerflow_sessions WHERE id = $1 FOR UPDATE"
        ))
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        let current = Session::from(row);
        let mut draft = current.clone();
        // dropping the transaction on rejection rolls it back
        mutator(&mut draft).map_err(StoreError::Rejected)?;
        draft.id = current.id.clone();
        draft.updated_at = current.updated_at;
        draft.touch();

        sqlx::query(
            "UPDATE containerflow_sessions \
             SET updated_at = $2, expires_at = $3, status = $4, labels = $5, metadata = $6 \
             WHERE id = $1",
        )
        .bind(&draft.id)
        .bind(draft.updated_at)
        .bind(draft.expires_at)
        .bind(draft.status.as_str())
        .bind(Json(&draft.labels))
        .bind(Json(&draft.metadata))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(draft)
    }

    async fn delete(&self, session_id: &str) -> StoreResult<bool> {
        self.ensure_open()?;
        let done = sqlx::query("DELETE FROM containerflow_sessions WHERE id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn list(&self) -> StoreResult<Vec<Session>> {
        self.ensure_open()?;
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM containerflow_sessions \
             WHERE expires_at > NOW() AND status <> 'expired' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Session::from).collect())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.ensure_open()?;
        let (total, expired): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
             COUNT(*) FILTER (WHERE expires_at <= NOW() OR status = 'expired') \
             FROM containerflow_sessions",
        )
        .fetch_one(&self.pool)
        .await?;

        let total = usize::try_from(total).unwrap_or(0);
        let expired = usize::try_from(expired).unwrap_or(0);
        Ok(StoreStats {
            total_sessions: total,
            active_sessions: total.saturating_sub(expired),
            expired_sessions: expired,
        })
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        self.pool.close().await;
        Ok(())
    }
}
