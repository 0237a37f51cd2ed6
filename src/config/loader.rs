//! Configuration Loader
//!
//! Environment-aware loading built on the `config` crate. Sources are layered
//! in order: built-in defaults, `containerflow.yaml`,
//! `containerflow.<environment>.yaml`, then `CONTAINERFLOW__*` variables
//! (double underscore separates nesting, e.g.
//! `CONTAINERFLOW__LOCKING__ACQUIRE_TIMEOUT_MS=5000`).

use super::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::logging::get_environment;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CONFIG_FILE_STEM: &str = "containerflow";
const ENV_PREFIX: &str = "CONTAINERFLOW";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: EngineConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> EngineResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> EngineResult<Arc<ConfigManager>> {
        let environment = get_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> EngineResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading engine configuration"
        );

        let config = Self::build(&config_directory, environment)?;
        config.validate()?;

        let manager = ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        };

        info!(
            environment = %manager.environment,
            backend = ?manager.config.store.backend,
            lock_timeout_ms = manager.config.locking.acquire_timeout_ms,
            "Configuration loaded successfully"
        );
        debug!(config = %manager.sanitized(), "Effective configuration");

        Ok(Arc::new(manager))
    }

    /// Wrap an already-built configuration (tests, embedding)
    pub fn from_config(config: EngineConfig) -> EngineResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: get_environment(),
            config_directory: PathBuf::from("config"),
        }))
    }

    fn build(config_directory: &Path, environment: &str) -> EngineResult<EngineConfig> {
        let base_file = config_directory.join(format!("{CONFIG_FILE_STEM}.yaml"));
        let env_file = config_directory.join(format!("{CONFIG_FILE_STEM}.{environment}.yaml"));

        let settings = config::Config::builder()
            .add_source(config::File::from(base_file).required(false))
            .add_source(config::File::from(env_file).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize::<EngineConfig>().map_err(|e| {
            EngineError::Configuration(format!(
                "Failed to deserialize configuration from {}: {e}",
                config_directory.display()
            ))
        })
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Configuration as JSON with secret-looking fields masked
    pub fn sanitized(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null);
        sanitize_json_recursive(&mut value);
        value
    }
}

const SENSITIVE_PATTERNS: [&str; 6] = ["password", "secret", "key", "token", "credential", "url"];

fn sanitize_json_recursive(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                let is_sensitive = SENSITIVE_PATTERNS
                    .iter()
                    .any(|pattern| key_lower.contains(pattern));

                if is_sensitive {
                    if let serde_json::Value::String(s) = val {
                        *val = serde_json::Value::String(mask(s));
                    }
                } else {
                    sanitize_json_recursive(val);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                sanitize_json_recursive(item);
            }
        }
        _ => {}
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        return "[EMPTY]".to_string();
    }
    // keep the scheme of connection strings, hide credentials and host
    if let Some((scheme, _)) = secret.split_once("://") {
        return format!("[MASKED: {scheme}://***]");
    }
    "[MASKED]".to_string()
}
