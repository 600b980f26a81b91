//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub downloads: DownloadConfig,
    pub logging: LoggingConfig,
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
    /// Maximum pooled connections shared by ingest workers
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    8
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

/// Timeline synchronization settings
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Minimum seconds between automatic syncs of one timeline
    pub auto_sync_interval_seconds: u64,
}

impl SyncConfig {
    pub fn auto_sync_interval(&self) -> Duration {
        Duration::from_secs(self.auto_sync_interval_seconds)
    }
}

/// Download hand-off settings
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Hand attached images to the coordinator as soon as they are stored
    pub load_attached_images: bool,
    /// Hand avatars to the coordinator when a user's avatar URL changes
    pub load_avatars: bool,
    /// Capacity of the queue feeding the download coordinator
    pub queue_capacity: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (MERGELINE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("database.path", "data/mergeline.db")?
            .set_default("database.max_connections", 8)?
            .set_default("database.busy_timeout_ms", 5000)?
            .set_default("sync.auto_sync_interval_seconds", 900)?
            .set_default("downloads.load_attached_images", true)?
            .set_default("downloads.load_avatars", true)?
            .set_default("downloads.queue_capacity", 256)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("MERGELINE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.sync.auto_sync_interval_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "sync.auto_sync_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.downloads.queue_capacity == 0 {
            return Err(crate::error::AppError::Config(
                "downloads.queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(crate::error::AppError::Config(
                "database.max_connections must be greater than 0".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            tracing::warn!(
                format = %self.logging.format,
                "Unknown logging.format; falling back to pretty output"
            );
        }

        Ok(())
    }
}
