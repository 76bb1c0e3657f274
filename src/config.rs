// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! User configuration, stored as JSON in `~/.vidqueue/config.json`.
//!
//! Every field has a default, so a partial (or missing) file is fine.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::{DownloaderCommand, QueueSettings};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Port the HTTP API listens on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address to bind to; 127.0.0.1 keeps the API local
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Where finished downloads are written
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    /// Downloader executable
    #[serde(default = "default_downloader")]
    pub downloader: PathBuf,
    /// Arguments placed before the per-job ones, e.g. `["-m", "yt_dlp"]`
    #[serde(default)]
    pub downloader_args: Vec<String>,
    /// A submitted URL must contain one of these
    #[serde(default = "default_allowed_hosts")]
    pub allowed_hosts: Vec<String>,
    /// Seconds between SIGTERM and a hard kill when cancelling
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Idle worker poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_port() -> u16 {
    5000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_downloader() -> PathBuf {
    PathBuf::from("yt-dlp")
}

fn default_allowed_hosts() -> Vec<String> {
    QueueSettings::default().allowed_hosts
}

fn default_cancel_grace_secs() -> u64 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            downloads_dir: default_downloads_dir(),
            downloader: default_downloader(),
            downloader_args: Vec::new(),
            allowed_hosts: default_allowed_hosts(),
            cancel_grace_secs: default_cancel_grace_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Config {
    pub fn downloader_command(&self) -> DownloaderCommand {
        DownloaderCommand::new(&self.downloader).with_prefix_args(self.downloader_args.clone())
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            allowed_hosts: self.allowed_hosts.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }
}

/// `~/.vidqueue`
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    Ok(home.join(".vidqueue"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
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
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.downloads_dir, PathBuf::from("downloads"));
        assert_eq!(config.allowed_hosts, vec!["youtube.com", "youtu.be"]);
        assert_eq!(config.cancel_grace(), Duration::from_secs(3));
        assert_eq!(config.downloader_command(), DownloaderCommand::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"port": 8080}"#).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.downloader, PathBuf::from("yt-dlp"));
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = Config::load_from(&temp_dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("nested").join("config.json");

        let config = Config {
            downloader: PathBuf::from("python3"),
            downloader_args: vec!["-m".to_string(), "yt_dlp".to_string()],
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        let command = loaded.downloader_command();
        assert_eq!(command.program, PathBuf::from("python3"));
        assert_eq!(command.prefix_args, vec!["-m", "yt_dlp"]);
    }

    #[test]
    fn test_invalid_file_is_error() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Invalid config file"));
    }
}
