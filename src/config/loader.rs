//! Configuration Loader
//!
//! Environment-aware configuration loading: YAML file discovery, environment
//! detection, overlay merging, and environment-variable overrides.
//!
//! Loading order, later steps winning:
//! 1. `EaselConfig::default()` fallbacks
//! 2. `{config_dir}/base.yaml`
//! 3. `{config_dir}/{environment}.yaml`
//! 4. Environment-variable overrides (`EASEL_BROKER_URL`,
//!    `EASEL_BROKER_TRANSPORT`)
//!
//! The config directory comes from `EASEL_CONFIG_DIR`, defaulting to
//! `config/easel`. A missing directory is not an error (defaults apply); a
//! present directory without any config file is.

use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::Value;
use thiserror::Error;
use tracing::{debug, info};

use super::{EaselConfig, TransportKind};

/// Ceiling on config file size; anything larger is rejected as corrupt
const MAX_CONFIG_FILE_BYTES: u64 = 1024 * 1024;

const ENV_CONFIG_DIR: &str = "EASEL_CONFIG_DIR";
const ENV_BROKER_URL: &str = "EASEL_BROKER_URL";
const ENV_BROKER_TRANSPORT: &str = "EASEL_BROKER_TRANSPORT";

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to read config file {path}: {message}")]
    FileRead { path: String, message: String },

    #[error("Invalid YAML in {path}: {message}")]
    Parse { path: String, message: String },

    #[error("No configuration files found in {directory} (looked for base.yaml and {environment}.yaml)")]
    NotFound { directory: String, environment: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigurationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    fn file_read(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::FileRead {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    fn parse(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Parse {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Loaded configuration plus the environment it was resolved for
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: EaselConfig,
    environment: String,
    source: String,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection.
    pub fn load() -> Result<Self, ConfigurationError> {
        let environment = Self::detect_environment();
        let dir = std::env::var(ENV_CONFIG_DIR).unwrap_or_else(|_| "config/easel".to_string());
        let dir = PathBuf::from(dir);

        if !dir.is_dir() {
            info!(
                environment = %environment,
                directory = %dir.display(),
                "📋 No config directory found, using built-in defaults"
            );
            let mut config = EaselConfig::default();
            Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
            config.validate()?;
            return Ok(Self {
                config,
                environment,
                source: "defaults".to_string(),
            });
        }

        Self::load_from_dir(&dir, &environment)
    }

    /// Load configuration from a specific directory with an explicit
    /// environment. Useful for testing without modifying global environment
    /// variables.
    pub fn load_from_dir(dir: &Path, environment: &str) -> Result<Self, ConfigurationError> {
        let base_path = dir.join("base.yaml");
        let overlay_path = dir.join(format!("{environment}.yaml"));

        let base = Self::read_yaml_if_present(&base_path)?;
        let overlay = Self::read_yaml_if_present(&overlay_path)?;

        if base.is_none() && overlay.is_none() {
            return Err(ConfigurationError::NotFound {
                directory: dir.display().to_string(),
                environment: environment.to_string(),
            });
        }

        let mut merged = base.unwrap_or(Value::Mapping(Default::default()));
        if let Some(overlay) = overlay {
            merge_values(&mut merged, overlay);
        }

        let mut config: EaselConfig =
            serde_yaml::from_value(merged).map_err(|e| ConfigurationError::parse(dir, e))?;

        Self::apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        config.validate()?;

        info!(
            environment = %environment,
            directory = %dir.display(),
            transport = %config.broker.transport,
            namespace = %config.topology.namespace,
            "📋 Configuration loaded"
        );
        debug!(config = ?config.sanitized(), "Effective configuration");

        Ok(Self {
            config,
            environment: environment.to_string(),
            source: dir.display().to_string(),
        })
    }

    /// Wrap an already-built config, validating it. Used by embedders that
    /// construct configuration programmatically.
    pub fn with_config(config: EaselConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            config,
            environment: Self::detect_environment(),
            source: "programmatic".to_string(),
        })
    }

    pub fn config(&self) -> &EaselConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Detect the runtime environment from process environment variables.
    pub fn detect_environment() -> String {
        Self::environment_from(|key| std::env::var(key).ok())
    }

    /// Environment detection against an arbitrary lookup, so the precedence
    /// order is testable without mutating process globals.
    pub fn environment_from<F>(lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in ["EASEL_ENV", "APP_ENV"] {
            if let Some(value) = lookup(key) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
        "development".to_string()
    }

    fn apply_env_overrides<F>(config: &mut EaselConfig, lookup: F) -> Result<(), ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BROKER_URL) {
            config.broker.url = url;
        }
        if let Some(transport) = lookup(ENV_BROKER_TRANSPORT) {
            config.broker.transport = match transport.as_str() {
                "amqp" => TransportKind::Amqp,
                "memory" => TransportKind::Memory,
                other => {
                    return Err(ConfigurationError::invalid(format!(
                        "{ENV_BROKER_TRANSPORT} must be 'amqp' or 'memory', got '{other}'"
                    )))
                }
            };
        }
        Ok(())
    }

    fn read_yaml_if_present(path: &Path) -> Result<Option<Value>, ConfigurationError> {
        if !path.is_file() {
            return Ok(None);
        }

        let metadata = fs::metadata(path).map_err(|e| ConfigurationError::file_read(path, e))?;
        if metadata.len() > MAX_CONFIG_FILE_BYTES {
            return Err(ConfigurationError::file_read(
                path,
                format!(
                    "file is {} bytes, limit is {MAX_CONFIG_FILE_BYTES}",
                    metadata.len()
                ),
            ));
        }

        let raw = fs::read_to_string(path).map_err(|e| ConfigurationError::file_read(path, e))?;
        let value: Value =
            serde_yaml::from_str(&raw).map_err(|e| ConfigurationError::parse(path, e))?;
        Ok(Some(value))
    }
}

/// Deep-merge `overlay` into `base`: mappings merge key-by-key, everything
/// else is replaced by the overlay value.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => {
                        base_map.insert(key, overlay_value);
                    }
                }
            }
        }
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}
