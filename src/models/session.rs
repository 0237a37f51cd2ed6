//! Session record owned by the durable store.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Expired,
    Suspended,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "expired" => Some(SessionStatus::Expired),
            "suspended" => Some(SessionStatus::Suspended),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity record for one client session.
///
/// `metadata` is the opaque container the engine keeps its workflow state in;
/// `updated_at` doubles as the optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(id: impl Into<String>, ttl: Duration) -> Self {
        let now = current_timestamp();
        Self {
            id: id.into(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            status: SessionStatus::Active,
            labels: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Version token for optimistic updates
    pub fn version(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Expired || self.expires_at <= now
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Advance `updated_at`, keeping it strictly increasing even when the clock
    /// has not moved (or moved backwards) since the previous write
    pub fn touch(&mut self) {
        self.updated_at = next_version(self.updated_at);
    }
}

/// Timestamps are kept at microsecond precision so they survive a round trip
/// through `timestamptz` unchanged
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn next_version(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = current_timestamp();
    let floor = previous + Duration::microseconds(1);
    if now > floor {
        now
    } else {
        floor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_active_until_ttl() {
        let session = Session::new("wf_abc", Duration::hours(1));
        assert_eq!(session.status, SessionStatus::Active);
        assert!(!session.is_expired());
        assert!(session.is_expired_at(session.expires_at));
    }

    #[test]
    fn test_touch_is_strictly_increasing() {
        let mut session = Session::new("wf_abc", Duration::hours(1));
        // simulate a clock that ran ahead on a previous write
        session.updated_at = Utc::now() + Duration::seconds(10);
        let before = session.version();
        session.touch();
        assert!(session.version() > before);
        let again = session.version();
        session.touch();
        assert!(session.version() > again);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(SessionStatus::parse("expired"), Some(SessionStatus::Expired));
        assert_eq!(SessionStatus::parse("zombie"), None);
    }
}
