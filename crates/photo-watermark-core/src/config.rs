//! Configuration management for the export engine

use crate::error::{ExportError, Result};
use crate::format_converter::DEFAULT_JPEG_QUALITY;
use crate::job_manager::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `PHOTO_WATERMARK__EXPORT__MAX_CONCURRENT_JOBS=4`
pub const ENV_PREFIX: &str = "PHOTO_WATERMARK";
pub const ENV_SEPARATOR: &str = "__";

/// Application configuration: storage, export engine and logging sections
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub export: ExportSettings,
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage root; the platform default is used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
    /// Extra directories scanned for fonts
    pub font_dirs: Vec<PathBuf>,
}

/// Export engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Worker pool size; CPU parallelism (at least 2) when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<usize>,
    pub retention: RetentionPolicy,
    pub default_jpeg_quality: u8,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: None,
            retention: RetentionPolicy::default(),
            default_jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Where log output goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub output_type: LogOutput,
    /// Directory for rolling log files when `output_type` is `file`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output_type: LogOutput::Console,
            output_path: None,
            json: false,
        }
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    /// Load from the platform config location
    pub fn new() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::with_path(config_path)
    }

    /// Load from `config_path`; a missing file yields defaults
    pub fn with_path(config_path: PathBuf) -> Result<Self> {
        let config = Self::load_layered(&config_path, None)?;
        Ok(Self {
            config_path,
            config,
        })
    }

    /// Effective configuration after layering
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Replace the configuration and persist it
    pub fn update_config(&mut self, config: AppConfig) -> Result<()> {
        self.config = config;
        self.save()
    }

    /// Write the configuration as TOML, creating parent directories
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ExportError::ConfigError {
                message: format!("Cannot create {:?}: {}", parent, e),
            })?;
        }

        let config_str = toml::to_string_pretty(&self.config).map_err(|e| ExportError::ConfigError {
            message: format!("Cannot encode configuration as TOML: {}", e),
        })?;

        std::fs::write(&self.config_path, config_str).map_err(|e| ExportError::ConfigError {
            message: format!("Cannot write {:?}: {}", self.config_path, e),
        })?;

        tracing::info!("Saved configuration to {:?}", self.config_path);
        Ok(())
    }

    /// `<config_dir>/photo-watermark/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| ExportError::ConfigError {
                message: "No platform configuration directory".to_string(),
            })?
            .join("photo-watermark");

        Ok(config_dir.join("config.toml"))
    }

    /// Defaults, then the TOML file if present, then environment overrides.
    /// `env` replaces the process environment when given.
    fn load_layered(path: &Path, env: Option<HashMap<String, String>>) -> Result<AppConfig> {
        let to_error = |e: config::ConfigError| ExportError::ConfigError {
            message: format!("Failed to load configuration from {:?}: {}", path, e),
        };

        let defaults = config::Config::try_from(&AppConfig::default()).map_err(to_error)?;
        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(env);

        let layered = config::Config::builder()
            .add_source(defaults)
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(environment)
            .build()
            .map_err(to_error)?;

        let config: AppConfig = layered.try_deserialize().map_err(to_error)?;
        if path.exists() {
            tracing::info!("Loaded configuration from {:?}", path);
        } else {
            tracing::debug!("No configuration file at {:?}, using defaults", path);
        }
        Ok(config)
    }
}
