//! Engine configuration
//!
//! Stored in `~/.config/databind/config.toml`.
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. Environment variables (`DATABIND_REFRESH_INTERVAL`, `DATABIND_DEFAULT_MODEL`)
//! 2. Config file
//! 3. Defaults

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bind::DEFAULT_REFRESH_INTERVAL_MS;
use crate::error::{BindError, Result};

pub const ENV_REFRESH_INTERVAL: &str = "DATABIND_REFRESH_INTERVAL";
pub const ENV_DEFAULT_MODEL: &str = "DATABIND_DEFAULT_MODEL";

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Polling interval for refresh providers, in milliseconds
    pub refresh_interval_ms: i64,

    /// Drop writes while the target is disconnected instead of holding them
    pub ignore_writes_when_disconnected: bool,

    /// Model used for binding names without a model prefix
    pub default_model: Option<String>,

    /// How long binding files wait for a model to register, in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
            ignore_writes_when_disconnected: false,
            default_model: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    /// Returns `~/.config/databind/` on Unix, `%APPDATA%/databind/` on Windows
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("databind")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Load from the default location. A missing file gives the defaults.
    pub fn load_default() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Load from `path`. Errors if the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| BindError::ConfigError {
            reason: format!("Failed to read config file {}: {}", path.display(), e),
        })?;

        toml::from_str(&content).map_err(|e| BindError::ConfigError {
            reason: format!("Failed to parse config file {}: {}", path.display(), e),
        })
    }

    /// Save to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| BindError::ConfigError {
                    reason: format!("Failed to create config directory: {}", e),
                })?;
            }
        }

        let content = toml::to_string_pretty(self).map_err(|e| BindError::ConfigError {
            reason: format!("Failed to serialize config: {}", e),
        })?;

        fs::write(path, content).map_err(|e| BindError::ConfigError {
            reason: format!("Failed to write config file: {}", e),
        })
    }

    /// Environment variables take precedence over file values. Empty or
    /// unparsable values are ignored.
    pub fn with_env(mut self) -> Self {
        if let Ok(raw) = std::env::var(ENV_REFRESH_INTERVAL) {
            match raw.trim().parse::<i64>() {
                Ok(interval) => self.refresh_interval_ms = interval,
                Err(_) if raw.trim().is_empty() => {}
                Err(_) => warn!(value = %raw, "Ignoring invalid {}", ENV_REFRESH_INTERVAL),
            }
        }

        if let Ok(model) = std::env::var(ENV_DEFAULT_MODEL) {
            if !model.is_empty() {
                self.default_model = Some(model);
            }
        }

        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_config_path_contains_databind() {
        let path = EngineConfig::config_path();
        assert!(path.to_string_lossy().contains("databind"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.refresh_interval_ms, DEFAULT_REFRESH_INTERVAL_MS);
        assert!(!config.ignore_writes_when_disconnected);
        assert!(config.default_model.is_none());
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let config = EngineConfig {
            refresh_interval_ms: 250,
            ignore_writes_when_disconnected: true,
            default_model: Some("plant".into()),
            connect_timeout_ms: 500,
        };
        config.save(&path).unwrap();

        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "default_model = \"plant\"\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.default_model.as_deref(), Some("plant"));
        assert_eq!(config.refresh_interval_ms, DEFAULT_REFRESH_INTERVAL_MS);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "refresh_interval_ms = \"soon\"").unwrap();

        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, BindError::ConfigError { .. }));
    }

    #[test]
    fn test_env_overrides_config() {
        env::set_var(ENV_REFRESH_INTERVAL, "750");
        env::set_var(ENV_DEFAULT_MODEL, "");

        let config = EngineConfig {
            default_model: Some("from-config".into()),
            ..Default::default()
        }
        .with_env();

        assert_eq!(config.refresh_interval_ms, 750);
        // empty env does not override
        assert_eq!(config.default_model.as_deref(), Some("from-config"));

        env::remove_var(ENV_REFRESH_INTERVAL);
        env::remove_var(ENV_DEFAULT_MODEL);
    }
}
