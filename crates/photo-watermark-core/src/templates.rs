//! File-backed watermark templates and last-used settings

use crate::error::{ExportError, Result};
use crate::models::{lenient_watermark, ExportPolicy, WatermarkSpec};
use crate::storage::StorageRoot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TEMPLATES_DIR: &str = "templates";
const SETTINGS_DIR: &str = "settings";
const LAST_SETTINGS_FILE: &str = "last.json";

/// A named, reusable watermark + export configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, deserialize_with = "lenient_watermark")]
    pub watermark_config: Option<WatermarkSpec>,
    #[serde(default)]
    pub export_config: Option<ExportPolicy>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Template {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            watermark_config: None,
            export_config: None,
            updated_at: None,
        }
    }
}

/// The configuration used by the most recent export
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSettings {
    #[serde(default, deserialize_with = "lenient_watermark")]
    pub watermark_config: Option<WatermarkSpec>,
    #[serde(default)]
    pub export_config: Option<ExportPolicy>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Templates stored as `<storage>/templates/<id>.json`
#[derive(Clone)]
pub struct TemplateStore {
    storage: Arc<dyn StorageRoot>,
}

impl TemplateStore {
    pub fn new(storage: Arc<dyn StorageRoot>) -> Self {
        Self { storage }
    }

    async fn directory(&self) -> Result<PathBuf> {
        let dir = self.storage.resolve(Path::new(TEMPLATES_DIR))?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// All readable templates, most recently updated first
    pub async fn list(&self) -> Result<Vec<Template>> {
        let dir = self.directory().await?;
        let mut templates = Vec::new();

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Template>(&path).await {
                Ok(template) => templates.push(template),
                Err(e) => warn!("Skipping unreadable template {:?}: {}", path, e),
            }
        }

        templates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(templates)
    }

    /// Store a template, assigning an id when it has none. The name is trimmed
    /// and must not be empty.
    pub async fn save(&self, mut template: Template) -> Result<Template> {
        let name = template.name.trim();
        if name.is_empty() {
            return Err(ExportError::Template {
                message: "Template name must not be empty".to_string(),
            });
        }
        template.name = name.to_string();

        let id = match template.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => validate_id(id)?.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        template.id = Some(id.clone());
        template.updated_at = Some(Utc::now());

        let path = self.directory().await?.join(format!("{}.json", id));
        write_json(&path, &template).await?;
        info!("Template {} ({}) saved", template.name, id);
        Ok(template)
    }

    pub async fn find(&self, id: &str) -> Result<Option<Template>> {
        let path = self.directory().await?.join(format!("{}.json", validate_id(id)?));
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        read_json(&path).await.map(Some)
    }

    /// Remove a template. Deleting a missing template is not an error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let path = self.directory().await?.join(format!("{}.json", validate_id(id)?));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Template {} deleted", id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Last settings stored as `<storage>/settings/last.json`
#[derive(Clone)]
pub struct SettingsStore {
    storage: Arc<dyn StorageRoot>,
}

impl SettingsStore {
    pub fn new(storage: Arc<dyn StorageRoot>) -> Self {
        Self { storage }
    }

    fn file_path(&self) -> Result<PathBuf> {
        self.storage
            .resolve(&Path::new(SETTINGS_DIR).join(LAST_SETTINGS_FILE))
    }

    /// `None` when nothing has been saved or the file cannot be read
    pub async fn read(&self) -> Option<LastSettings> {
        let path = self.file_path().ok()?;
        match read_json(&path).await {
            Ok(settings) => Some(settings),
            Err(e) => {
                debug!("No last settings at {:?}: {}", path, e);
                None
            }
        }
    }

    pub async fn save(&self, mut settings: LastSettings) -> Result<LastSettings> {
        settings.updated_at = Some(Utc::now());
        let path = self.file_path()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_json(&path, &settings).await?;
        Ok(settings)
    }

    pub async fn delete(&self) -> Result<()> {
        match tokio::fs::remove_file(self.file_path()?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Ids become file names, so no separators or parent references
fn validate_id(id: &str) -> Result<&str> {
    if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
        return Err(ExportError::Template {
            message: format!("Invalid template id: {:?}", id),
        });
    }
    Ok(id)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
