//! Storage root resolution for default export, template and settings paths

use crate::error::{ExportError, Result};
use crate::utils::normalize_path;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

const APP_DIR_NAME: &str = "PhotoWatermark";
const HOME_DIR_NAME: &str = ".photo-watermark";

/// Resolves paths relative to the application's storage root
pub trait StorageRoot: Send + Sync {
    /// Absolute, existing storage root
    fn base_dir(&self) -> Result<PathBuf>;

    /// Join `relative` onto the storage root
    fn resolve(&self, relative: &Path) -> Result<PathBuf> {
        Ok(self.base_dir()?.join(relative))
    }
}

/// Local filesystem storage root. Uses the configured directory when it can
/// be created, otherwise the platform default. Resolved once, then cached.
#[derive(Debug)]
pub struct LocalStorage {
    configured: Option<PathBuf>,
    fallback: PathBuf,
    resolved: Mutex<Option<PathBuf>>,
}

impl LocalStorage {
    pub fn new(configured: Option<PathBuf>) -> Self {
        Self::with_fallback(configured, default_base_dir())
    }

    pub fn with_fallback(configured: Option<PathBuf>, fallback: PathBuf) -> Self {
        Self {
            configured: configured.filter(|p| !p.as_os_str().is_empty()),
            fallback,
            resolved: Mutex::new(None),
        }
    }

    fn ensure_base_dir(&self) -> Result<PathBuf> {
        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dir) = resolved.as_ref() {
            return Ok(dir.clone());
        }

        let dir = match &self.configured {
            Some(configured) => {
                let candidate = absolutize(configured);
                match std::fs::create_dir_all(&candidate) {
                    Ok(()) => candidate,
                    Err(e) => {
                        tracing::warn!(
                            "Cannot use storage directory {:?} ({}), falling back to {:?}",
                            candidate,
                            e,
                            self.fallback
                        );
                        self.create_fallback(&candidate)?
                    }
                }
            }
            None => self.create_fallback(&self.fallback)?,
        };

        tracing::debug!("Storage root resolved to {:?}", dir);
        *resolved = Some(dir.clone());
        Ok(dir)
    }

    fn create_fallback(&self, attempted: &Path) -> Result<PathBuf> {
        let fallback = absolutize(&self.fallback);
        std::fs::create_dir_all(&fallback).map_err(|e| ExportError::Storage {
            message: format!("Failed to create storage directory {:?}: {}", attempted, e),
        })?;
        Ok(fallback)
    }
}

impl StorageRoot for LocalStorage {
    fn base_dir(&self) -> Result<PathBuf> {
        self.ensure_base_dir()
    }
}

/// `$APPDATA/PhotoWatermark` when `APPDATA` is set, else `~/.photo-watermark`
pub fn default_base_dir() -> PathBuf {
    if let Some(app_data) = std::env::var_os("APPDATA").filter(|v| !v.is_empty()) {
        return absolutize(&PathBuf::from(app_data).join(APP_DIR_NAME));
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    absolutize(&home.join(HOME_DIR_NAME))
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_default();
        normalize_path(&cwd.join(path))
    }
}
