//! Engine configuration management.
//!
//! This module handles loading and saving the engine configuration,
//! which includes the REST base URL, the push channel URL, and the
//! tuning knobs for freshness and interest debouncing.
//!
//! Configuration is stored at `~/.config/buildcache/config.json`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "buildcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// How long a fetched path/query stays trusted without re-fetching (ms)
const DEFAULT_FRESHNESS_TTL_MS: u64 = 2_000;

/// Interest recomputation debounce window (ms)
const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Deadline for a command round-trip on the push channel (seconds)
const DEFAULT_SEND_TIMEOUT_SECS: u64 = 20;

/// HTTP request timeout (seconds)
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// REST endpoint prefix, e.g. `https://dashboard.example.org/api/v2`
    pub api_base: String,
    /// Push channel endpoint, e.g. `wss://dashboard.example.org/ws`
    pub ws_url: String,
    /// Cache directory override; defaults to the platform cache dir
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_freshness_ttl_ms")]
    pub freshness_ttl_ms: u64,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_freshness_ttl_ms() -> u64 {
    DEFAULT_FRESHNESS_TTL_MS
}

fn default_debounce_ms() -> u64 {
    DEFAULT_DEBOUNCE_MS
}

fn default_send_timeout_secs() -> u64 {
    DEFAULT_SEND_TIMEOUT_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "api/v2".to_string(),
            ws_url: "ws://localhost/ws".to_string(),
            cache_dir: None,
            freshness_ttl_ms: DEFAULT_FRESHNESS_TTL_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            Error::Store(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not find config directory",
            ))
        })?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir().ok_or_else(|| {
            Error::Store(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not find cache directory",
            ))
        })?;
        Ok(cache_dir.join(APP_NAME))
    }
}
