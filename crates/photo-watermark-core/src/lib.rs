//! # Photo Watermark Core
//!
//! Batch export engine for photos: decode, optional resize, text or image
//! watermark compositing, and collision-safe encoding into an output
//! directory. Batches run as background jobs on a bounded worker pool with
//! observable progress and cooperative cancellation.

pub mod color;
pub mod config;
pub mod error;
pub mod fonts;
pub mod format_converter;
pub mod job_manager;
pub mod layout;
pub mod logging;
pub mod models;
pub mod progress;
pub mod resize;
pub mod storage;
pub mod templates;
pub mod utils;
pub mod watermark_engine;

// Re-export commonly used types
pub use config::{AppConfig, ConfigManager};
pub use error::{ExportError, Result};
pub use fonts::{FontCatalog, FontStyle, SystemFontCatalog};
pub use job_manager::{JobManager, JobManagerConfig, RetentionPolicy};
pub use models::*;
pub use storage::{LocalStorage, StorageRoot};
pub use templates::{LastSettings, SettingsStore, Template, TemplateStore};
pub use watermark_engine::WatermarkEngine;

use std::sync::Arc;

/// Every long-lived component, wired from one [`AppConfig`]
pub struct ExportService {
    pub jobs: JobManager,
    pub templates: TemplateStore,
    pub settings: SettingsStore,
    pub fonts: Arc<dyn FontCatalog>,
}

impl ExportService {
    /// Build the service. Font discovery happens here, once.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let storage: Arc<dyn StorageRoot> = Arc::new(LocalStorage::new(config.storage.base_dir.clone()));
        let fonts = SystemFontCatalog::discover(&config.storage.font_dirs)?.into_shared();
        Ok(Self::with_parts(config, storage, fonts))
    }

    pub fn with_parts(config: &AppConfig, storage: Arc<dyn StorageRoot>, fonts: Arc<dyn FontCatalog>) -> Self {
        let engine = WatermarkEngine::new(fonts.clone());
        let jobs = JobManager::new(JobManagerConfig::from_settings(&config.export), engine, storage.clone());

        Self {
            jobs,
            templates: TemplateStore::new(storage.clone()),
            settings: SettingsStore::new(storage),
            fonts,
        }
    }
}

/// Initialize logging and build the export service
pub fn init(config: &AppConfig) -> Result<ExportService> {
    logging::init_logging(&config.logging)?;
    let service = ExportService::from_config(config)?;

    tracing::info!("Photo watermark core {} initialized", version());
    Ok(service)
}

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
