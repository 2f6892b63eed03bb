//! Bootstrap configuration loading and path resolution
//!
//! Resolution priority for every path setting:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unreadable config file never aborts startup: the caller gets
//! a warning in the log and compiled defaults.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the TOML config file
pub const CONFIG_ENV_VAR: &str = "TAP_CONFIG";

/// Environment variable naming the media root folder
pub const MEDIA_ROOT_ENV_VAR: &str = "TAP_MEDIA_ROOT";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    /// Session snapshot (phases + durations) to load at startup
    #[serde(default)]
    pub session_file: Option<PathBuf>,

    /// Folder that track ids are resolved against
    #[serde(default)]
    pub media_root: Option<PathBuf>,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Engine tuning table, deserialized by the engine crate
    #[serde(default)]
    pub engine: Option<toml::Table>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TomlConfig {
    /// Parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse config text
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load the config file if one resolves, otherwise return defaults
    ///
    /// Parse errors in an existing file are also downgraded to a warning.
    pub fn load_or_default(cli_path: Option<&Path>) -> Self {
        let Some(path) = resolve_config_path(cli_path) else {
            info!("No config file found, using compiled defaults");
            return Self::default();
        };

        match Self::load(&path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Failed to load config {}: {}; using defaults", path.display(), e);
                Self::default()
            }
        }
    }
}

/// Compiled defaults for the current platform
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub media_root: PathBuf,
    pub log_level: String,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        let media_root = dirs::audio_dir()
            .map(|d| d.join("tap"))
            .or_else(|| dirs::data_local_dir().map(|d| d.join("tap").join("media")))
            .unwrap_or_else(|| PathBuf::from("./tap_media"));

        Self {
            media_root,
            log_level: default_log_level(),
        }
    }
}

/// Resolve the config file path
///
/// CLI argument, then `TAP_CONFIG`, then `<config_dir>/tap/config.toml` if it
/// exists. Returns None when nothing resolves.
pub fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir()
        .map(|d| d.join("tap").join("config.toml"))
        .filter(|p| p.exists())
}

/// Resolve the media root folder
pub fn resolve_media_root(cli_path: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_path {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(MEDIA_ROOT_ENV_VAR) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.media_root {
        return path.clone();
    }

    CompiledDefaults::for_current_platform().media_root
}

/// Ensure a folder exists, creating it if needed
pub fn ensure_directory(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(Error::Config(format!(
            "{} exists but is not a directory",
            path.display()
        )));
    }
    std::fs::create_dir_all(path)?;
    Ok(())
}
