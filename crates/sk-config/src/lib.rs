pub mod config;
mod manager;

pub use config::{AppConfig, LoggingConfig, StorageConfig};
pub use manager::{ConfigError, ConfigManager};
