// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent configuration stored at `~/.vidqueue/config.json`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::{default_tool_candidates, DEFAULT_CONCURRENT, MAX_CONCURRENT, MIN_CONCURRENT};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    /// HTTP port (default: 3000)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address the server binds to (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    /// Concurrent downloads, clamped to 1..=10 when used
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Executables tried in order when looking for yt-dlp
    #[serde(default = "default_tool_candidates")]
    pub tool_candidates: Vec<String>,
    /// Extra CORS origins. Localhost is always allowed.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Seconds between an interrupt and a hard kill
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

fn default_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent() -> usize {
    DEFAULT_CONCURRENT
}

fn default_kill_grace_secs() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            downloads_dir: default_downloads_dir(),
            max_concurrent: default_max_concurrent(),
            tool_candidates: default_tool_candidates(),
            allowed_origins: Vec::new(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

impl Config {
    /// Ceiling to start the queue with.
    pub fn ceiling(&self) -> usize {
        self.max_concurrent.clamp(MIN_CONCURRENT, MAX_CONCURRENT)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Read a config file, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".vidqueue"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

pub fn load_config() -> Result<Config> {
    Config::load_from(&config_path()?)
}

pub fn save_config(config: &Config) -> Result<()> {
    config.save_to(&config_path()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.port, 3000);
        assert_eq!(config.ceiling(), 3);
        assert_eq!(config.kill_grace(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"port": 8080, "max_concurrent": 50}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.ceiling(), MAX_CONCURRENT);
        assert!(!config.tool_candidates.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            allowed_origins: vec!["http://media.lan:5173".to_string()],
            max_concurrent: 0,
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.ceiling(), MIN_CONCURRENT);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ port: ").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid config file"));
    }
}
