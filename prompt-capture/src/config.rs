//! Configuration management for prompt capture.
//!
//! Loads configuration from TOML files and provides runtime defaults.

use crate::types::PlatformKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether capture is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Skip detection and use this platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformKind>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
            platform: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Delay before the first extraction after page load or navigation
    #[serde(default = "default_extract_delay")]
    pub extract_delay_ms: u64,

    /// Delay before the single retry when an extraction finds nothing
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// URL polling interval for conversation switches
    #[serde(default = "default_url_check_interval")]
    pub url_check_interval_ms: u64,

    /// Periodic background extraction, 0 disables
    #[serde(default = "default_periodic_extraction")]
    pub periodic_extraction_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            extract_delay_ms: default_extract_delay(),
            retry_delay_ms: default_retry_delay(),
            url_check_interval_ms: default_url_check_interval(),
            periodic_extraction_ms: default_periodic_extraction(),
        }
    }
}

impl TimingConfig {
    pub fn extract_delay(&self) -> Duration {
        Duration::from_millis(self.extract_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn url_check_interval(&self) -> Duration {
        Duration::from_millis(self.url_check_interval_ms)
    }

    pub fn periodic_extraction(&self) -> Option<Duration> {
        (self.periodic_extraction_ms > 0).then(|| Duration::from_millis(self.periodic_extraction_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// How long a non-empty full result answers repeat calls
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,

    /// Default extraction timeout
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Delay before Completed/Error falls back to Idle
    #[serde(default = "default_idle_reset")]
    pub idle_reset_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl(),
            timeout_ms: default_timeout(),
            idle_reset_ms: default_idle_reset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,

    /// Element id of the injected UI whose mutations are ignored
    #[serde(default = "default_ui_root_id")]
    pub ui_root_id: String,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce(),
            ui_root_id: default_ui_root_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Drop prompts whose trimmed content is already stored
    #[serde(default = "default_true")]
    pub auto_deduplicate: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            auto_deduplicate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Messages shorter than this (in chars) are not prompts
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,

    /// Tags skipped by the text extractor on top of the built-in list
    #[serde(default)]
    pub extra_ignored_tags: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_content_chars: default_min_content_chars(),
            extra_ignored_tags: Vec::new(),
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_extract_delay() -> u64 {
    500
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_url_check_interval() -> u64 {
    500
}

fn default_periodic_extraction() -> u64 {
    2000
}

fn default_cache_ttl() -> u64 {
    5000
}

fn default_timeout() -> u64 {
    10_000
}

fn default_idle_reset() -> u64 {
    1000
}

fn default_debounce() -> u64 {
    500
}

fn default_ui_root_id() -> String {
    crate::watcher::DEFAULT_UI_ROOT_ID.to_string()
}

fn default_min_content_chars() -> usize {
    2
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        Self::load_from_path(Self::default_config_path())
    }

    /// Load configuration from a specific path, falling back to defaults
    pub fn load_from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::try_load_from_path(path) {
            Ok(config) => {
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(ConfigError::Io(_)) => {
                info!("No config file found at {:?}, using defaults", path);
                Self::default()
            }
            Err(e) => {
                warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path, surfacing errors
    pub fn try_load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("prompt-capture")
            .join("config.toml")
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to_path(Self::default_config_path())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.general.enabled);
        assert_eq!(config.general.platform, None);
        assert_eq!(config.timing.extract_delay_ms, 500);
        assert_eq!(config.timing.retry_delay_ms, 1000);
        assert_eq!(config.coordinator.cache_ttl_ms, 5000);
        assert_eq!(config.coordinator.timeout_ms, 10_000);
        assert_eq!(config.watcher.debounce_ms, 500);
        assert_eq!(config.watcher.ui_root_id, "ph-sidebar-root");
        assert!(config.store.auto_deduplicate);
        assert_eq!(config.extraction.min_content_chars, 2);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[general]
enabled = true
log_level = "debug"
platform = "qwen-cn"

[timing]
extract_delay_ms = 250
periodic_extraction_ms = 0

[watcher]
debounce_ms = 200

[extraction]
extra_ignored_tags = ["nav"]
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.platform, Some(PlatformKind::QwenCn));
        assert_eq!(config.timing.extract_delay(), Duration::from_millis(250));
        assert_eq!(config.timing.retry_delay_ms, 1000);
        assert_eq!(config.timing.periodic_extraction(), None);
        assert_eq!(config.watcher.debounce_ms, 200);
        assert_eq!(config.watcher.ui_root_id, "ph-sidebar-root");
        assert_eq!(config.extraction.extra_ignored_tags, vec!["nav".to_string()]);
        assert_eq!(config.coordinator.idle_reset_ms, 1000);
    }

    #[test]
    fn test_unknown_platform_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[general]\nplatform = \"bard\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.general.platform = Some(PlatformKind::Claude);
        config.store.auto_deduplicate = false;
        config.save_to_path(&path).unwrap();

        let loaded = Config::try_load_from_path(&path).unwrap();
        assert_eq!(loaded.general.platform, Some(PlatformKind::Claude));
        assert!(!loaded.store.auto_deduplicate);
    }

    #[test]
    fn test_missing_or_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Config::load_from_path(dir.path().join("absent.toml"));
        assert!(missing.general.enabled);

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[timing\nextract_delay_ms = ").unwrap();
        assert!(matches!(
            Config::try_load_from_path(&broken),
            Err(ConfigError::Parse(_))
        ));
        assert_eq!(Config::load_from_path(&broken).timing.extract_delay_ms, 500);
    }
}
