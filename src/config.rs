//! Host Configuration
//!
//! Handles parsing and management of modhost.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::host::{InstanceOptions, MIN_DRAIN_WAIT};
use crate::http::DEFAULT_STATUS;

/// Default configuration file name.
pub const CONFIG_FILE: &str = "modhost.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching modhost.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HostConfig {
    /// Module to load
    #[serde(default)]
    pub module: ModuleConfig,

    /// Host behavior
    #[serde(default)]
    pub host: HostSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HostConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: HostConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from the current directory or parents.
    pub fn load_from_cwd() -> ConfigResult<Self> {
        let cwd = std::env::current_dir().map_err(ConfigError::Io)?;
        Self::find_and_load(&cwd)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding config
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Options for every module instance the host opens.
    ///
    /// A `drain_warn_interval_ms` of 0 is raised to [`MIN_DRAIN_WAIT`].
    pub fn instance_options(&self) -> InstanceOptions {
        InstanceOptions {
            drain_warn_interval: Duration::from_millis(self.host.drain_warn_interval_ms)
                .max(MIN_DRAIN_WAIT),
            require_abi_version: self.module.require_abi_version,
        }
    }
}

/// Which module to load and how to find it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    /// Library path or bare name (resolved through `search_paths`)
    #[serde(default)]
    pub path: Option<String>,

    /// Extra directories searched for bare module names
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Refuse modules that do not report their ABI version
    #[serde(default)]
    pub require_abi_version: bool,
}

/// Host behavior around module calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostSettings {
    /// Interval between warnings while unload waits on in-flight calls
    #[serde(default = "default_drain_warn_interval_ms")]
    pub drain_warn_interval_ms: u64,

    /// Status applied when no module set one
    #[serde(default = "default_status")]
    pub default_status: u16,
}

fn default_drain_warn_interval_ms() -> u64 {
    1000
}

fn default_status() -> u16 {
    DEFAULT_STATUS
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            drain_warn_interval_ms: default_drain_warn_interval_ms(),
            default_status: default_status(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "modhost=debug"
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.module.path, None);
        assert_eq!(config.host.default_status, 200);
        assert_eq!(config.host.drain_warn_interval_ms, 1000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[module]
path = "target/debug/libmodhost_demo.so"
search_paths = ["/opt/modules"]
require_abi_version = true

[host]
drain_warn_interval_ms = 250

[logging]
level = "modhost=debug"
format = "json"
"#;
        let config: HostConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.module.path.as_deref(),
            Some("target/debug/libmodhost_demo.so")
        );
        assert_eq!(config.module.search_paths, vec![PathBuf::from("/opt/modules")]);
        assert!(config.module.require_abi_version);
        assert_eq!(config.host.drain_warn_interval_ms, 250);
        assert_eq!(config.host.default_status, 200);
        assert_eq!(config.logging.format, LogFormat::Json);

        let options = config.instance_options();
        assert_eq!(options.drain_warn_interval, Duration::from_millis(250));
        assert!(options.require_abi_version);
    }

    #[test]
    fn test_zero_drain_interval_is_raised() {
        let config: HostConfig = toml::from_str("[host]\ndrain_warn_interval_ms = 0\n").unwrap();
        assert_eq!(config.host.drain_warn_interval_ms, 0);
        assert_eq!(config.instance_options().drain_warn_interval, MIN_DRAIN_WAIT);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("modhost_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);

        let mut config = HostConfig::default();
        config.module.path = Some("demo".to_string());
        config.host.default_status = 204;
        config.save(&path).unwrap();

        assert_eq!(HostConfig::load(&path).unwrap(), config);
        assert_eq!(HostConfig::find_and_load(&dir).unwrap(), config);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file() {
        let err = HostConfig::load(Path::new("/nonexistent/modhost.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
