//! Core data models for export requests, watermark specs and job snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier for export jobs
pub type JobId = Uuid;

/// A source image handed to the exporter: its original name and raw bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

impl std::fmt::Debug for SourceFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceFile")
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Watermark and export configuration submitted alongside the files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    #[serde(
        default,
        deserialize_with = "lenient_watermark",
        skip_serializing_if = "Option::is_none"
    )]
    pub watermark_config: Option<WatermarkSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_config: Option<ExportPolicy>,
}

/// Watermark specification: exactly one of a text or an image overlay,
/// plus an optional layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkSpec {
    #[serde(flatten)]
    pub kind: WatermarkKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<LayoutSpec>,
}

impl WatermarkSpec {
    pub fn text(text: TextWatermark) -> Self {
        Self {
            kind: WatermarkKind::Text { text },
            layout: None,
        }
    }

    pub fn image(image: ImageWatermark) -> Self {
        Self {
            kind: WatermarkKind::Image { image },
            layout: None,
        }
    }

    pub fn with_layout(mut self, layout: LayoutSpec) -> Self {
        self.layout = Some(layout);
        self
    }
}

/// Watermark config field reader. The `type` tag is matched ignoring case;
/// a missing or unknown tag, or a missing or malformed branch object, reads
/// as "no watermark" instead of rejecting the surrounding document.
pub fn lenient_watermark<'de, D>(deserializer: D) -> std::result::Result<Option<WatermarkSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(WatermarkSpec::from_lenient_value))
}

impl WatermarkSpec {
    fn from_lenient_value(mut value: Value) -> Option<Self> {
        let object = value.as_object_mut()?;
        let tag = object
            .get("type")
            .and_then(Value::as_str)
            .map(|t| t.trim().to_ascii_lowercase());

        let kind = match tag.as_deref() {
            Some("text") => branch(object.remove("text"), "text").map(|text| WatermarkKind::Text { text }),
            Some("image") => branch(object.remove("image"), "image").map(|image| WatermarkKind::Image { image }),
            other => {
                tracing::debug!("Ignoring watermark with unsupported type {:?}", other);
                None
            }
        }?;

        let layout = object.remove("layout").and_then(|layout| branch(Some(layout), "layout"));
        Some(Self { kind, layout })
    }
}

fn branch<T: serde::de::DeserializeOwned>(value: Option<Value>, field: &str) -> Option<T> {
    let value = value.filter(|v| !v.is_null())?;
    serde_json::from_value(value)
        .map_err(|e| tracing::debug!("Ignoring malformed watermark {}: {}", field, e))
        .ok()
}

/// Discriminated watermark payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WatermarkKind {
    Text { text: TextWatermark },
    Image { image: ImageWatermark },
}

/// Text watermark styling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TextWatermark {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub font_size: Option<u32>,
    pub bold: bool,
    pub italic: bool,
    /// Fill color as hex text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Opacity percentage in [0, 100]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stroke: Option<StrokeStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow: Option<ShadowStyle>,
}

impl TextWatermark {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Glyph outline stroke
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrokeStyle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
}

/// Drop shadow drawn beneath the text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShadowStyle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset_y: Option<f64>,
}

/// Image watermark: embedded base64 data, optionally behind a data-URI prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageWatermark {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    pub data: String,
    /// Fraction of the target image width, in [0.05, 1.0]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    /// Opacity percentage in [0, 100]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f64>,
}

/// Placement of the watermark on the target image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    /// Relative horizontal anchor in [0, 1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// Relative vertical anchor in [0, 1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_deg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

impl LayoutSpec {
    pub fn preset(name: impl Into<String>) -> Self {
        Self {
            preset: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Export policy: where, in which format and how to name and size outputs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    pub format: OutputFormat,
    /// JPEG quality percentage, clamped to [0, 100]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jpeg_quality: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizePolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub naming: Option<NamingRule>,
}

/// Output encodings supported by the writer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
}

impl OutputFormat {
    /// Get the file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }

    /// Lenient parse: `jpg`/`jpeg` map to JPEG, anything else to PNG.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => OutputFormat::Jpeg,
            _ => OutputFormat::Png,
        }
    }
}

impl From<String> for OutputFormat {
    fn from(value: String) -> Self {
        OutputFormat::parse_lenient(&value)
    }
}

/// Resize policy applied before watermarking
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResizePolicy {
    pub mode: ResizeMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

impl ResizePolicy {
    pub fn by_width(width: i64) -> Self {
        Self {
            mode: ResizeMode::ByWidth,
            width: Some(width),
            ..Default::default()
        }
    }

    pub fn by_height(height: i64) -> Self {
        Self {
            mode: ResizeMode::ByHeight,
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn by_percent(percent: f64) -> Self {
        Self {
            mode: ResizeMode::ByPercent,
            percent: Some(percent),
            ..Default::default()
        }
    }
}

/// Mutually exclusive resize modes. Unknown mode text maps to `Unrecognized`,
/// which leaves the image untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResizeMode {
    ByWidth,
    ByHeight,
    ByPercent,
    #[default]
    Unrecognized,
}

impl From<String> for ResizeMode {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "w" | "width" | "bywidth" => ResizeMode::ByWidth,
            "h" | "height" | "byheight" => ResizeMode::ByHeight,
            "pct" | "percent" | "bypercent" => ResizeMode::ByPercent,
            _ => ResizeMode::Unrecognized,
        }
    }
}

impl From<ResizeMode> for String {
    fn from(mode: ResizeMode) -> Self {
        match mode {
            ResizeMode::ByWidth => "w",
            ResizeMode::ByHeight => "h",
            ResizeMode::ByPercent => "pct",
            ResizeMode::Unrecognized => "",
        }
        .to_string()
    }
}

/// Prefix/suffix applied to output base names
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamingRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

/// Job status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

/// Outcome for a single source file. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFileResult {
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExportFileResult {
    pub fn succeeded(source_name: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            output_name: Some(output_name.into()),
            success: true,
            message: None,
        }
    }

    pub fn failed(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            output_name: None,
            success: false,
            message: Some(message.into()),
        }
    }
}

/// Immutable point-in-time view of an export job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub output_directory: PathBuf,
    pub total_files: usize,
    pub processed_files: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Shared with the job's later snapshots until the next file finishes
    pub results: Arc<[ExportFileResult]>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Fraction of processed files; zero for an empty batch.
pub fn progress_fraction(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    processed as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_spec_text_json_shape() {
        let json = r##"{
            "type": "text",
            "text": { "content": "Sample", "opacity": 80, "color": "#FFFFFF" },
            "layout": { "preset": "bottom-right", "rotationDeg": 15 }
        }"##;

        let spec: WatermarkSpec = serde_json::from_str(json).unwrap();
        match &spec.kind {
            WatermarkKind::Text { text } => {
                assert_eq!(text.content, "Sample");
                assert_eq!(text.opacity, Some(80.0));
                assert!(!text.bold);
            }
            other => panic!("expected text watermark, got {:?}", other),
        }
        let layout = spec.layout.unwrap();
        assert_eq!(layout.preset.as_deref(), Some("bottom-right"));
        assert_eq!(layout.rotation_deg, Some(15.0));
    }

    #[test]
    fn test_watermark_spec_image_json_shape() {
        let json = r#"{ "type": "image", "image": { "data": "data:image/png;base64,AAAA", "scale": 0.3 } }"#;
        let spec: WatermarkSpec = serde_json::from_str(json).unwrap();
        assert!(matches!(spec.kind, WatermarkKind::Image { ref image } if image.scale == Some(0.3)));
        assert!(spec.layout.is_none());
    }

    #[test]
    fn test_output_format_is_lenient() {
        assert_eq!(OutputFormat::parse_lenient("JPG"), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::parse_lenient("jpeg"), OutputFormat::Jpeg);
        assert_eq!(OutputFormat::parse_lenient("png"), OutputFormat::Png);
        assert_eq!(OutputFormat::parse_lenient("webp"), OutputFormat::Png);

        let policy: ExportPolicy = serde_json::from_str(r#"{ "format": "tiff" }"#).unwrap();
        assert_eq!(policy.format, OutputFormat::Png);
        let policy: ExportPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy.format, OutputFormat::Png);
    }

    fn request_watermark(watermark: &str) -> Option<WatermarkSpec> {
        let json = format!(r#"{{ "watermarkConfig": {}, "exportConfig": {{}} }}"#, watermark);
        let request: ExportRequest = serde_json::from_str(&json).unwrap();
        assert!(request.export_config.is_some());
        request.watermark_config
    }

    #[test]
    fn test_watermark_type_ignores_case() {
        let spec = request_watermark(r#"{ "type": "Text", "text": { "content": "Hi" } }"#).unwrap();
        assert_eq!(spec.kind, WatermarkKind::Text { text: TextWatermark::new("Hi") });

        let spec = request_watermark(r#"{ "type": " IMAGE ", "image": { "data": "abc", "scale": 0.5 } }"#).unwrap();
        match spec.kind {
            WatermarkKind::Image { image } => assert_eq!(image.scale, Some(0.5)),
            other => panic!("expected image watermark, got {:?}", other),
        }
    }

    #[test]
    fn test_unusable_watermark_means_none() {
        assert!(request_watermark(r#"{ "text": { "content": "Hi" } }"#).is_none());
        assert!(request_watermark(r#"{ "type": "video", "text": { "content": "Hi" } }"#).is_none());
        assert!(request_watermark(r#"{ "type": 3, "text": { "content": "Hi" } }"#).is_none());
        assert!(request_watermark(r#"{ "type": "text" }"#).is_none());
        assert!(request_watermark(r#"{ "type": "text", "text": null }"#).is_none());
        assert!(request_watermark(r#"{ "type": "image", "text": { "content": "Hi" } }"#).is_none());
        assert!(request_watermark(r#"{ "type": "text", "text": "Hi" }"#).is_none());
        assert!(request_watermark("null").is_none());
        assert!(request_watermark(r#""text""#).is_none());

        let request: ExportRequest = serde_json::from_str(r#"{ "exportConfig": {} }"#).unwrap();
        assert!(request.watermark_config.is_none());
    }

    #[test]
    fn test_malformed_layout_keeps_watermark() {
        let spec = request_watermark(
            r#"{ "type": "text", "text": { "content": "Hi" }, "layout": { "rotationDeg": "steep" } }"#,
        )
        .unwrap();
        assert!(spec.layout.is_none());
        assert!(matches!(spec.kind, WatermarkKind::Text { .. }));
    }

    #[test]
    fn test_format_extension() {
        assert_eq!(OutputFormat::Jpeg.extension(), "jpg");
        assert_eq!(OutputFormat::Png.extension(), "png");
    }

    #[test]
    fn test_resize_mode_aliases() {
        let policy: ResizePolicy = serde_json::from_str(r#"{ "mode": "w", "width": 200 }"#).unwrap();
        assert_eq!(policy.mode, ResizeMode::ByWidth);
        let policy: ResizePolicy = serde_json::from_str(r#"{ "mode": "byPercent", "percent": 50 }"#).unwrap();
        assert_eq!(policy.mode, ResizeMode::ByPercent);
        let policy: ResizePolicy = serde_json::from_str(r#"{ "mode": "stretch" }"#).unwrap();
        assert_eq!(policy.mode, ResizeMode::Unrecognized);
    }

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert_eq!(serde_json::to_string(&JobStatus::Queued).unwrap(), "\"QUEUED\"");
    }

    #[test]
    fn test_file_result_serialization_omits_absent_fields() {
        let ok = ExportFileResult::succeeded("a.jpg", "a.png");
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["sourceName"], "a.jpg");
        assert_eq!(json["outputName"], "a.png");
        assert!(json.get("message").is_none());

        let failed = ExportFileResult::failed("b.jpg", "Unable to read image");
        let json = serde_json::to_value(&failed).unwrap();
        assert!(json.get("outputName").is_none());
        assert_eq!(json["success"], false);
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(progress_fraction(0, 0), 0.0);
        assert_eq!(progress_fraction(1, 4), 0.25);
        assert_eq!(progress_fraction(3, 3), 1.0);
    }
}
