//! # Retry Advisor
//!
//! Turns a step failure into retry advice using the [`RetryPolicyTable`] and
//! the backoff calculator. The engine never retries on its own; the advice is
//! returned to the caller, which decides whether to re-invoke the step.

use crate::orchestration::backoff_calculator;
use crate::orchestration::retry_policy::{RetryPolicy, RetryPolicyTable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry guidance attached to every failure report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAdvice {
    pub retryable: bool,
    /// Attempt number that just failed (1-based)
    pub attempt: u32,
    pub max_retries: u32,
    pub next_attempt: Option<u32>,
    pub attempts_remaining: u32,
    #[serde(with = "duration_millis_opt")]
    pub suggested_delay: Option<Duration>,
    /// Pattern that classified the error as transient
    pub matched_pattern: Option<String>,
}

impl RetryAdvice {
    pub fn suggested_delay_ms(&self) -> Option<u64> {
        self.suggested_delay
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryAdvisor {
    table: RetryPolicyTable,
}

impl RetryAdvisor {
    pub fn new(table: RetryPolicyTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &RetryPolicyTable {
        &self.table
    }

    pub fn policy_for(&self, step: &str) -> &RetryPolicy {
        self.table.policy_for(step)
    }

    /// Advice for `step` failing with `error` on `attempt`
    pub fn advise(&self, step: &str, error: &str, attempt: u32) -> RetryAdvice {
        let policy = self.table.policy_for(step);
        let matched_pattern = policy.matching_pattern(error).map(str::to_string);
        let retryable = matched_pattern.is_some() && attempt < policy.max_retries;

        let (next_attempt, suggested_delay) = if retryable {
            (
                Some(attempt + 1),
                Some(backoff_calculator::delay(policy, i64::from(attempt))),
            )
        } else {
            (None, None)
        };

        RetryAdvice {
            retryable,
            attempt,
            max_retries: policy.max_retries,
            next_attempt,
            attempts_remaining: policy.max_retries.saturating_sub(attempt),
            suggested_delay,
            matched_pattern,
        }
    }
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
