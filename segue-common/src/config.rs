//! Configuration loading and config file resolution
//!
//! Settings come from a TOML file whose location is resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`SEGUE_CONFIG`)
//! 3. Per-user config file (`<config dir>/segue/config.toml`)
//! 4. Compiled defaults (fallback)
//!
//! A missing config file is never fatal: a warning is logged and defaults are used.

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SEGUE_CONFIG";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct TomlConfig {
    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduling and playback settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PlaybackConfig {
    /// Tick interval in milliseconds
    #[serde(default = "default_refresh_rate_ms")]
    pub refresh_rate_ms: u64,

    /// Look-ahead margin for loop and delayed-start pre-roll, in seconds
    #[serde(default = "default_next_margin_secs")]
    pub next_margin_secs: f64,

    /// Default fade length in seconds
    #[serde(default = "default_fade_duration_secs")]
    pub fade_duration_secs: f64,

    /// Delay before decoded audio of a disconnected segment is dropped
    #[serde(default = "default_cache_grace_ms")]
    pub cache_grace_ms: u64,

    /// Initial master volume
    #[serde(default = "default_volume")]
    pub volume: f64,
}

/// Network settings applied to manifest and segment requests
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NetworkConfig {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_refresh_rate_ms() -> u64 {
    250
}

fn default_next_margin_secs() -> f64 {
    5.0
}

fn default_fade_duration_secs() -> f64 {
    0.03
}

fn default_cache_grace_ms() -> u64 {
    10_000
}

fn default_volume() -> f64 {
    1.0
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            refresh_rate_ms: default_refresh_rate_ms(),
            next_margin_secs: default_next_margin_secs(),
            fade_duration_secs: default_fade_duration_secs(),
            cache_grace_ms: default_cache_grace_ms(),
            volume: default_volume(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            headers: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TomlConfig {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load the resolved config file, falling back to defaults when it is missing
    ///
    /// A file that exists but cannot be parsed is still an error.
    pub fn load_or_default(cli_arg: Option<&Path>) -> Result<Self> {
        match resolve_config_path(cli_arg, CONFIG_ENV_VAR) {
            Some(path) if path.exists() => Self::load(&path),
            Some(path) => {
                warn!("Config file {:?} not found, using defaults", path);
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Reject values the player cannot work with
    pub fn validate(&self) -> Result<()> {
        let playback = &self.playback;
        if playback.refresh_rate_ms == 0 {
            return Err(Error::Config(
                "playback.refresh_rate_ms must be greater than zero".to_string(),
            ));
        }
        if !(playback.next_margin_secs >= 0.0) {
            return Err(Error::Config(format!(
                "playback.next_margin_secs must not be negative (got {})",
                playback.next_margin_secs
            )));
        }
        if !(playback.fade_duration_secs >= 0.0) {
            return Err(Error::Config(format!(
                "playback.fade_duration_secs must not be negative (got {})",
                playback.fade_duration_secs
            )));
        }
        if !(playback.volume >= 0.0) {
            return Err(Error::Config(format!(
                "playback.volume must not be negative (got {})",
                playback.volume
            )));
        }
        Ok(())
    }
}

/// Resolve the config file location
///
/// The CLI argument and environment variable are returned even if the file does
/// not exist, so the caller can warn about it. The per-user default is returned
/// only when present.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default_config_path().filter(|path| path.exists())
}

/// Per-user config file path for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("segue").join("config.toml"))
}
