use std::path::{Path, PathBuf};

use anyhow::Context;
use directories::ProjectDirs;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::config::AppConfig;

const CONFIG_FILE: &str = "config.toml";

/// Resolves the config and data directories and reads/writes `config.toml`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigManager {
    config_dir: PathBuf,
    data_dir: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Platform directories for storykeep
    #[instrument(level = "debug")]
    pub fn from_project_dirs() -> Result<Self, ConfigError> {
        let proj_dirs = ProjectDirs::from("com", "storykeep", "storykeep").ok_or_else(|| {
            error!("Failed to determine project directories - this usually indicates an unsupported OS or missing home directory");
            ConfigError::ProjectDirectoriesUnavailable
        })?;

        Ok(Self::new(proj_dirs.config_dir(), proj_dirs.data_dir()))
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Where the token store lives: the configured override, else the
    /// platform data directory
    pub fn data_dir<'a>(&'a self, config: &'a AppConfig) -> &'a Path {
        config
            .storage
            .data_dir
            .as_deref()
            .unwrap_or(&self.data_dir)
    }

    /// Read `config.toml`, writing the defaults first if it does not exist
    #[instrument(skip(self), level = "info")]
    pub async fn load_or_default(&self) -> Result<AppConfig, ConfigError> {
        let config_file = self.config_file();
        if tokio::fs::metadata(&config_file).await.is_err() {
            info!(
                "Config file doesn't exist, writing defaults: {}",
                config_file.display()
            );
            let config = AppConfig::default();
            self.save(&config).await?;
            return Ok(config);
        }

        self.load().await
    }

    #[instrument(skip(self), level = "debug")]
    pub async fn load(&self) -> Result<AppConfig, ConfigError> {
        let config_file = self.config_file();
        debug!("Loading config from: {}", config_file.display());

        let content = tokio::fs::read(&config_file)
            .await
            .context("Failed to read config.toml file")
            .map_err(|e| {
                error!(
                    "Failed to read config file {}: {}",
                    config_file.display(),
                    e
                );
                ConfigError::ConfigFileReadFailed {
                    path: config_file.clone(),
                    source: e,
                }
            })?;

        let config: AppConfig = toml::from_slice(&content)
            .context("Failed to parse config.toml file")
            .map_err(|e| {
                error!(
                    "Failed to parse config file {}: {}",
                    config_file.display(),
                    e
                );
                ConfigError::ConfigParsingFailed {
                    path: config_file.clone(),
                    source: e,
                }
            })?;

        info!("Loaded config from {}", config_file.display());
        Ok(config)
    }

    #[instrument(skip(self, config), level = "debug")]
    pub async fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        if (tokio::fs::metadata(&self.config_dir).await).is_err() {
            info!(
                "Config directory doesn't exist, creating: {}",
                self.config_dir.display()
            );
            tokio::fs::create_dir_all(&self.config_dir)
                .await
                .context("Failed to create config directory")
                .map_err(|e| {
                    error!(
                        "Failed to create config directory {}: {}",
                        self.config_dir.display(),
                        e
                    );
                    ConfigError::DirectoryCreationFailed {
                        path: self.config_dir.clone(),
                        source: e,
                    }
                })?;
        }

        let toml = toml::to_string_pretty(config)
            .context("Failed to serialize config to TOML")
            .map_err(|e| {
                error!("Failed to serialize config: {}", e);
                ConfigError::ConfigSerializationFailed { source: e }
            })?;

        let config_file = self.config_file();
        tokio::fs::write(&config_file, toml)
            .await
            .context("Failed to write config.toml file")
            .map_err(|e| {
                error!(
                    "Failed to write config file {}: {}",
                    config_file.display(),
                    e
                );
                ConfigError::ConfigFileWriteFailed {
                    path: config_file.clone(),
                    source: e,
                }
            })?;

        info!("Saved config at {}", config_file.display());
        Ok(())
    }
}


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "Project directories are unavailable - this usually indicates an unsupported OS or missing home directory"
    )]
    ProjectDirectoriesUnavailable,

    #[error("Failed to create directory '{path}': {source}")]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to read config file '{path}': {source}")]
    ConfigFileReadFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to write config file '{path}': {source}")]
    ConfigFileWriteFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParsingFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to serialize config: {source}")]
    ConfigSerializationFailed {
        #[source]
        source: anyhow::Error,
    },
}
