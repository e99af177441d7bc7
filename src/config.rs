use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::download::key::DEFAULT_IDENTITY_HEADERS;
use crate::download::{DEFAULT_MAX_CONCURRENT, DownloaderOptions, HttpTransportOptions};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub downloader: DownloaderConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderConfig {
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    #[serde(default = "default_identity_headers")]
    pub identity_headers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_partial_dir")]
    pub partial_dir: PathBuf,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

const MAX_CONCURRENT_LIMIT: usize = 64;

// Default value functions
fn default_max_concurrent_downloads() -> usize {
    DEFAULT_MAX_CONCURRENT
}
fn default_cache_root() -> PathBuf {
    cache_base_dir().join("downloads")
}
fn default_identity_headers() -> Vec<String> {
    DEFAULT_IDENTITY_HEADERS
        .iter()
        .map(|h| h.to_string())
        .collect()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    concat!("fetchcache/", env!("CARGO_PKG_VERSION")).to_string()
}
fn default_partial_dir() -> PathBuf {
    cache_base_dir().join("partial")
}
fn default_progress_interval_ms() -> u64 {
    250
}

fn cache_base_dir() -> PathBuf {
    ProjectDirs::from("", "", "fetchcache")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("fetchcache"))
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            cache_root: default_cache_root(),
            identity_headers: default_identity_headers(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            partial_dir: default_partial_dir(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl Config {
    pub fn downloader_options(&self) -> DownloaderOptions {
        DownloaderOptions {
            max_concurrent: self.downloader.max_concurrent_downloads,
            cache_root: self.downloader.cache_root.clone(),
            identity_headers: self.downloader.identity_headers.clone(),
        }
    }

    pub fn transport_options(&self) -> HttpTransportOptions {
        HttpTransportOptions {
            timeout: Duration::from_secs(self.transport.timeout_secs),
            user_agent: self.transport.user_agent.clone(),
            partial_dir: self.transport.partial_dir.clone(),
            progress_interval: Duration::from_millis(self.transport.progress_interval_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let concurrency = self.downloader.max_concurrent_downloads;
        if concurrency == 0 || concurrency > MAX_CONCURRENT_LIMIT {
            anyhow::bail!(
                "max_concurrent_downloads must be between 1 and {}",
                MAX_CONCURRENT_LIMIT
            );
        }

        if self.downloader.cache_root.as_os_str().is_empty() {
            anyhow::bail!("cache_root cannot be empty");
        }

        // A full cache clear must never reach in-flight partial files.
        if self
            .transport
            .partial_dir
            .starts_with(&self.downloader.cache_root)
        {
            anyhow::bail!(
                "partial_dir {:?} must not be inside cache_root {:?}",
                self.transport.partial_dir,
                self.downloader.cache_root
            );
        }

        if self.transport.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be greater than 0");
        }

        if self.transport.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent cannot be empty");
        }

        Ok(())
    }
}

pub struct ConfigManager {
    config_file: PathBuf,
    config: Config,
}

impl ConfigManager {
    /// Load the config from the platform config directory, creating a default
    /// one if none exists.
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("", "", "fetchcache")
            .context("Failed to determine config directory")?;
        Self::from_file(project_dirs.config_dir().join("config.toml"))
    }

    /// Load the config at `config_file`, writing defaults there if missing.
    pub fn from_file(config_file: impl Into<PathBuf>) -> Result<Self> {
        let config_file = config_file.into();

        if let Some(config_dir) = config_file.parent() {
            if !config_dir.as_os_str().is_empty() && !config_dir.exists() {
                fs::create_dir_all(config_dir).with_context(|| {
                    format!("Failed to create config directory: {:?}", config_dir)
                })?;
            }
        }

        let config = if config_file.exists() {
            Self::load_config(&config_file)?
        } else {
            let default_config = Config::default();
            Self::save_config(&config_file, &default_config)?;
            default_config
        };

        Ok(Self {
            config_file,
            config,
        })
    }

    /// Get a reference to the current config
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a mutable reference to the current config
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Save the current config to disk
    pub fn save(&self) -> Result<()> {
        Self::save_config(&self.config_file, &self.config)
    }

    /// Get the config file path
    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    pub fn validate(&self) -> Result<()> {
        self.config.validate()
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(&self.config).context("Failed to serialize config")
    }

    fn load_config(config_file: &Path) -> Result<Config> {
        let content = fs::read_to_string(config_file)
            .with_context(|| format!("Failed to read config file: {:?}", config_file))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", config_file))?;

        Ok(config)
    }

    fn save_config(config_file: &Path, config: &Config) -> Result<()> {
        let content = toml::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(config_file, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_file))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.downloader.max_concurrent_downloads, 4);
        assert_eq!(config.downloader_options().max_concurrent, 4);
        assert_eq!(
            config.transport_options().progress_interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [downloader]
            max_concurrent_downloads = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.downloader.max_concurrent_downloads, 2);
        assert_eq!(config.transport.timeout_secs, 30);
        assert!(config.downloader.identity_headers.contains(&"range".to_string()));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.downloader.max_concurrent_downloads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.partial_dir = config.downloader.cache_root.join("partial");
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.user_agent = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_manager_creates_and_reloads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut manager = ConfigManager::from_file(&path).unwrap();
        assert!(path.exists());

        manager.config_mut().downloader.max_concurrent_downloads = 7;
        manager.save().unwrap();

        let reloaded = ConfigManager::from_file(&path).unwrap();
        assert_eq!(reloaded.config().downloader.max_concurrent_downloads, 7);
        assert!(reloaded.to_toml().unwrap().contains("max_concurrent_downloads = 7"));
    }
}
