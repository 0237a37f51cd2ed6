//! # Retry Policy Table
//!
//! Per-step retry limits, retryable error patterns and backoff bounds. Steps
//! without an entry get the default policy; configuration can replace any
//! entry or the default.

use crate::config::{RetryConfig, RetryPolicyConfig};
use crate::constants::steps;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Case-insensitive substrings; stored lowercased
    pub retryable_error_patterns: Vec<String>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_secs: u64, max_secs: u64, patterns: &[&str]) -> Self {
        Self {
            max_retries,
            retryable_error_patterns: patterns.iter().map(|p| p.to_lowercase()).collect(),
            backoff_base: Duration::from_secs(base_secs),
            backoff_max: Duration::from_secs(max_secs),
        }
    }

    /// Policy for steps without an entry
    pub fn default_policy() -> Self {
        Self::new(3, 2, 30, &["timeout", "connection reset", "temporary failure"])
    }

    /// Whether `error` contains any retryable pattern.
    ///
    /// An empty error or an empty pattern list never matches.
    pub fn is_retryable(&self, error: &str) -> bool {
        self.matching_pattern(error).is_some()
    }

    /// First pattern contained in `error`, compared case-insensitively
    pub fn matching_pattern(&self, error: &str) -> Option<&str> {
        if error.trim().is_empty() {
            return None;
        }
        let lowered = error.to_lowercase();
        self.retryable_error_patterns
            .iter()
            .filter(|p| !p.is_empty())
            .find(|p| lowered.contains(p.as_str()))
            .map(String::as_str)
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retryable_error_patterns: config
                .retryable_error_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicyTable {
    policies: HashMap<String, RetryPolicy>,
    default_policy: RetryPolicy,
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RetryPolicyTable {
    /// The pipeline's built-in table
    pub fn builtin() -> Self {
        let policies = [
            (
                steps::ANALYZE_REPOSITORY,
                RetryPolicy::new(2, 1, 5, &["timeout", "resource temporarily unavailable"]),
            ),
            (
                steps::GENERATE_DOCKERFILE,
                RetryPolicy::new(3, 2, 20, &["timeout", "rate limit", "service unavailable"]),
            ),
            (
                steps::BUILD_IMAGE,
                RetryPolicy::new(
                    3,
                    5,
                    60,
                    &[
                        "docker daemon",
                        "not responding",
                        "timeout",
                        "connection reset",
                        "no space left on device",
                        "temporary failure",
                    ],
                ),
            ),
            (
                steps::SCAN_IMAGE,
                RetryPolicy::new(2, 2, 30, &["timeout", "connection reset", "database download"]),
            ),
            (steps::TAG_IMAGE, RetryPolicy::new(2, 1, 5, &["timeout"])),
            (
                steps::PUSH_IMAGE,
                RetryPolicy::new(
                    5,
                    2,
                    60,
                    &[
                        "timeout",
                        "connection reset",
                        "rate limit",
                        "too many requests",
                        "503",
                        "502",
                    ],
                ),
            ),
            (
                steps::GENERATE_K8S_MANIFESTS,
                RetryPolicy::new(3, 2, 20, &["timeout", "rate limit"]),
            ),
            (
                steps::PREPARE_CLUSTER,
                RetryPolicy::new(
                    3,
                    3,
                    30,
                    &["timeout", "connection refused", "connection reset"],
                ),
            ),
            (
                steps::DEPLOY_APPLICATION,
                RetryPolicy::new(3, 5, 60, &["timeout", "connection refused", "etcdserver"]),
            ),
            (
                steps::VERIFY_DEPLOYMENT,
                RetryPolicy::new(5, 5, 60, &["timeout", "not ready", "connection refused"]),
            ),
        ]
        .into_iter()
        .map(|(name, policy)| (name.to_string(), policy))
        .collect();

        Self {
            policies,
            default_policy: RetryPolicy::default_policy(),
        }
    }

    /// Built-in table with configured entries layered on top
    pub fn from_config(config: &RetryConfig) -> Self {
        let mut table = Self::builtin();
        if let Some(default_policy) = &config.default_policy {
            table.default_policy = RetryPolicy::from(default_policy);
        }
        for (step, policy) in &config.overrides {
            table.policies.insert(step.clone(), RetryPolicy::from(policy));
        }
        table
    }

    /// Policy for `step`, falling back to the default
    pub fn policy_for(&self, step: &str) -> &RetryPolicy {
        self.policies.get(step).unwrap_or(&self.default_policy)
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    pub fn has_policy(&self, step: &str) -> bool {
        self.policies.contains_key(step)
    }
}
