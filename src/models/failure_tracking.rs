//! Deploy-step failure tracking.
//!
//! Counts consecutive redirects per corrective target so the redirect engine
//! can switch targets after repeated failures down one path. Created lazily on
//! the first deploy failure; the history only grows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub redirect_to: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentFailureTracking {
    pub consecutive_failures: BTreeMap<String, u32>,
    pub last_redirect_to: String,
    pub total_attempts: u32,
    pub failure_history: Vec<FailureRecord>,
}

impl DeploymentFailureTracking {
    pub fn consecutive(&self, target: &str) -> u32 {
        self.consecutive_failures.get(target).copied().unwrap_or(0)
    }

    pub fn reset(&mut self, target: &str) {
        self.consecutive_failures.insert(target.to_string(), 0);
    }

    /// Count one more redirect to `target` and append it to the history
    pub fn record(&mut self, target: &str, error: &str) {
        *self
            .consecutive_failures
            .entry(target.to_string())
            .or_insert(0) += 1;
        self.last_redirect_to = target.to_string();
        self.total_attempts += 1;
        self.failure_history.push(FailureRecord {
            timestamp: Utc::now(),
            redirect_to: target.to_string(),
            error: error.to_string(),
        });
    }
}
