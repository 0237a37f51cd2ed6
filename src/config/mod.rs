//! # Engine Configuration
//!
//! Typed configuration for the workflow engine. Every section carries
//! defaults, so an empty or partial YAML file is valid; [`ConfigManager`]
//! layers files and environment variables on top of those defaults.
//!
//! ```yaml
//! # config/containerflow.yaml
//! locking:
//!   acquire_timeout_ms: 30000
//!   cleanup_interval_seconds: 300
//! redirect:
//!   alternation_threshold: 2
//! retry:
//!   overrides:
//!     build_image:
//!       max_retries: 4
//!       retryable_error_patterns: ["timeout", "docker daemon"]
//!       backoff_base_ms: 5000
//!       backoff_max_ms: 60000
//! ```

pub mod loader;

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use loader::ConfigManager;

/// Root configuration structure mirroring containerflow.yaml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session lock acquisition and registry cleanup
    pub locking: LockingConfig,

    /// Retry policy overrides layered over the built-in table
    pub retry: RetryConfig,

    /// Redirect decision tuning
    pub redirect: RedirectConfig,

    /// Session lifetime
    pub session: SessionConfig,

    /// Durable store backend
    pub store: StoreConfig,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Upper bound on how long a caller waits for a session lock
    pub acquire_timeout_ms: u64,
    /// Interval of the background sweep that drops locks of expired sessions
    pub cleanup_interval_seconds: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
            cleanup_interval_seconds: 300,
        }
    }
}

impl LockingConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

/// Serializable form of a retry policy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicyConfig {
    pub max_retries: u32,
    #[serde(default)]
    pub retryable_error_patterns: Vec<String>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Replaces the built-in default policy for unconfigured steps
    pub default_policy: Option<RetryPolicyConfig>,
    /// Per-step replacements keyed by step name
    pub overrides: HashMap<String, RetryPolicyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedirectConfig {
    /// Consecutive failures down one corrective path before switching to the alternate
    pub alternation_threshold: u32,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            alternation_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 24 * 60 * 60,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive; derived from the environment when absent
    pub level: Option<String>,
    pub json: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            json: false,
            ansi: true,
        }
    }
}

impl EngineConfig {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> EngineResult<()> {
        if self.locking.acquire_timeout_ms == 0 {
            return Err(EngineError::Configuration(
                "locking.acquire_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.redirect.alternation_threshold == 0 {
            return Err(EngineError::Configuration(
                "redirect.alternation_threshold must be greater than 0".to_string(),
            ));
        }

        if self.session.ttl_seconds == 0 {
            return Err(EngineError::Configuration(
                "session.ttl_seconds must be greater than 0".to_string(),
            ));
        }

        if let Some(policy) = &self.retry.default_policy {
            validate_policy("retry.default_policy", policy)?;
        }
        for (step, policy) in &self.retry.overrides {
            validate_policy(&format!("retry.overrides.{step}"), policy)?;
        }

        if self.store.backend == StoreBackend::Postgres
            && self
                .store
                .database_url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
        {
            return Err(EngineError::Configuration(
                "store.database_url is required for the postgres backend".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_policy(path: &str, policy: &RetryPolicyConfig) -> EngineResult<()> {
    if policy.max_retries == 0 {
        return Err(EngineError::Configuration(format!(
            "{path}.max_retries must be greater than 0"
        )));
    }
    if policy.backoff_max_ms <= policy.backoff_base_ms {
        return Err(EngineError::Configuration(format!(
            "{path}.backoff_max_ms ({}) must exceed backoff_base_ms ({})",
            policy.backoff_max_ms, policy.backoff_base_ms
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32, base: u64, max: u64) -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_retries,
            retryable_error_patterns: vec!["timeout".to_string()],
            backoff_base_ms: base,
            backoff_max_ms: max,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.redirect.alternation_threshold, 2);
        assert_eq!(config.locking.acquire_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_zero_retries() {
        let mut config = EngineConfig::default();
        config
            .retry
            .overrides
            .insert("build_image".to_string(), policy(0, 1000, 5000));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.overrides.build_image.max_retries"));
    }

    #[test]
    fn test_rejects_inverted_backoff_bounds() {
        let mut config = EngineConfig::default();
        config.retry.default_policy = Some(policy(3, 5000, 5000));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_postgres_requires_url() {
        let mut config = EngineConfig::default();
        config.store.backend = StoreBackend::Postgres;
        assert!(config.validate().is_err());

        config.store.database_url = Some("postgresql://localhost/containerflow".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_sections_fall_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_value(serde_json::json!({"locking": {"acquire_timeout_ms": 5}}))
                .unwrap();
        assert_eq!(config.locking.acquire_timeout_ms, 5);
        assert_eq!(config.locking.cleanup_interval_seconds, 300);
        assert_eq!(config.session.ttl_seconds, 86_400);
    }
}
