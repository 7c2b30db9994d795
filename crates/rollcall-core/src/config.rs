//! Application configuration management.
//!
//! Configuration is layered: built-in defaults, then
//! `~/.config/rollcall/config.json` if present, then `ROLLCALL_*`
//! environment variables. The cache TTL and the session policy constants
//! are all overridable here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::client::DEFAULT_TIMEOUT_SECS;
use crate::auth::{SessionPolicy, DEFAULT_MAX_EXTENSIONS};
use crate::cache::DEFAULT_KEY_PREFIX;

/// Application name used for config directory paths
const APP_NAME: &str = "rollcall";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";

const ENV_API_URL: &str = "ROLLCALL_API_URL";
const ENV_API_TIMEOUT: &str = "ROLLCALL_API_TIMEOUT_SECS";
const ENV_CACHE_PREFIX: &str = "ROLLCALL_CACHE_PREFIX";
const ENV_CACHE_TTL: &str = "ROLLCALL_CACHE_TTL_MINUTES";
const ENV_SESSION_WINDOW: &str = "ROLLCALL_SESSION_WINDOW_MINUTES";
const ENV_SESSION_MAX_EXTENSIONS: &str = "ROLLCALL_SESSION_MAX_EXTENSIONS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub key_prefix: String,
    pub default_ttl_minutes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            default_ttl_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub window_minutes: u64,
    pub max_extensions: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            window_minutes: 30,
            max_extensions: DEFAULT_MAX_EXTENSIONS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub cache: CacheSettings,
    pub session: SessionSettings,
}

impl Config {
    /// Load from the config file (if any), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Ok(path) => Self::load_from(&path)?,
            Err(e) => {
                warn!(error = %e, "No config directory, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load a config file; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Write to the default config path, returning where it went.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `ROLLCALL_*` overrides read through `lookup`. Values that do
    /// not parse are ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL) {
            self.api.base_url = url;
        }
        if let Some(prefix) = lookup(ENV_CACHE_PREFIX) {
            self.cache.key_prefix = prefix;
        }
        if let Some(secs) = parse_override(&lookup, ENV_API_TIMEOUT) {
            self.api.timeout_secs = secs;
        }
        if let Some(minutes) = parse_override(&lookup, ENV_CACHE_TTL) {
            self.cache.default_ttl_minutes = minutes;
        }
        if let Some(minutes) = parse_override(&lookup, ENV_SESSION_WINDOW) {
            self.session.window_minutes = minutes;
        }
        if let Some(max) = parse_override(&lookup, ENV_SESSION_MAX_EXTENSIONS) {
            self.session.max_extensions = max;
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_minutes * 60)
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            window: Duration::from_secs(self.session.window_minutes * 60),
            max_extensions: self.session.max_extensions,
        }
    }
}

fn parse_override<T, F>(lookup: &F, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparseable override");
            None
        }
    }
}
