//! Configuration loading and management for callosum.
//!
//! Settings come from `callosum.toml` and are merged onto built-in defaults, with
//! environment variable overrides for the server endpoint and model.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:11434";
pub const DEFAULT_MODEL: &str = "mistral";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 10_000;

const CONFIG_FILE: &str = "callosum.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Storage paths configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base path for data storage
    pub path: PathBuf,
}

/// User-facing settings. Every field falls back to its default when absent
/// from the stored file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the local inference server
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_ms: u64,
    /// Character budget for extracted page content
    pub max_context_chars: usize,
    /// Consumed by browser front ends; the CLI has no sidebar.
    pub auto_open_sidebar: bool,
    pub include_page_context: bool,
    pub storage: StorageConfig,
}

/// Immutable snapshot handed to the inference client for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub endpoint: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            auto_open_sidebar: true,
            include_page_context: true,
            storage: StorageConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from the default location (callosum.toml in cwd or home).
    ///
    /// A missing file is not an error: the defaults are used as-is.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match Self::find_config_file() {
            Some(path) => Self::read(&path)?,
            None => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Load settings from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = Self::read(path)?;
        settings.apply_env();
        Ok(settings)
    }

    /// Parse stored overrides and merge them onto the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Write the full settings record to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path used when no config file exists yet.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("callosum").join(CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    /// Build a validated request snapshot. Fails fast on empty endpoint or
    /// model and on out-of-range numeric options.
    pub fn request_config(&self) -> Result<RequestConfig, ConfigError> {
        let endpoint = self.endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(ConfigError::Invalid("endpoint must not be empty".into()));
        }
        let model = self.model.trim();
        if model.is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be positive".into()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".into()));
        }

        Ok(RequestConfig {
            endpoint: endpoint.to_string(),
            model: model.to_string(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            timeout: Duration::from_millis(self.timeout_ms),
        })
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var("CALLOSUM_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("CALLOSUM_MODEL") {
            self.model = model;
        }
    }

    /// Find the config file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        // Check current directory first
        let local_config = PathBuf::from(CONFIG_FILE);
        if local_config.exists() {
            return Some(local_config);
        }

        if let Some(home) = dirs::home_dir() {
            let home_config = home.join(".config").join("callosum").join(CONFIG_FILE);
            if home_config.exists() {
                return Some(home_config);
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.endpoint, "http://127.0.0.1:11434");
        assert_eq!(settings.model, "mistral");
        assert_eq!(settings.max_tokens, 1000);
        assert_eq!(settings.max_context_chars, 10_000);
        assert_eq!(settings.timeout_ms, 30_000);
        assert!(settings.include_page_context);
    }

    #[test]
    fn test_partial_overrides_merge_onto_defaults() {
        let settings = Settings::from_toml(
            r#"
            model = "llama3"
            temperature = 0.2
            "#,
        )
        .unwrap();

        assert_eq!(settings.model, "llama3");
        assert_eq!(settings.temperature, 0.2);
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_request_config_rejects_empty_model() {
        let settings = Settings {
            model: "  ".to_string(),
            ..Settings::default()
        };
        assert!(matches!(
            settings.request_config(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_request_config_rejects_empty_endpoint() {
        let settings = Settings {
            endpoint: String::new(),
            ..Settings::default()
        };
        assert!(settings.request_config().is_err());
    }

    #[test]
    fn test_request_config_rejects_temperature_out_of_range() {
        let settings = Settings {
            temperature: 2.5,
            ..Settings::default()
        };
        assert!(settings.request_config().is_err());
    }

    #[test]
    fn test_request_config_trims_trailing_slash() {
        let settings = Settings {
            endpoint: "http://localhost:11434/".to_string(),
            timeout_ms: 500,
            ..Settings::default()
        };
        let request = settings.request_config().unwrap();
        assert_eq!(request.endpoint, "http://localhost:11434");
        assert_eq!(request.timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let settings = Settings {
            model: "phi3".to_string(),
            max_context_chars: 4000,
            ..Settings::default()
        };

        settings.save_to(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let reloaded = Settings::from_toml(&content).unwrap();
        assert_eq!(reloaded, settings);
    }
}
