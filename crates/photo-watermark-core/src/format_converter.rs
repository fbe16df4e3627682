//! Output writing: collision-free naming and PNG/JPEG encoding

use crate::error::{ExportError, Result};
use crate::models::{ExportPolicy, NamingRule, OutputFormat};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, RgbImage, RgbaImage};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const DEFAULT_JPEG_QUALITY: u8 = 92;

/// Encoding options resolved from an export policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    pub format: OutputFormat,
    /// Encoder quality in 1..=100, only used for JPEG
    pub jpeg_quality: u8,
}

impl EncodeOptions {
    pub fn for_policy(policy: &ExportPolicy, default_quality: u8) -> Self {
        Self {
            format: policy.format,
            jpeg_quality: resolve_jpeg_quality(policy.jpeg_quality, default_quality),
        }
    }
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Clamp a quality percentage to [0, 100]. The encoder's lowest setting is 1,
/// so 0 encodes as 1.
pub fn resolve_jpeg_quality(percent: Option<i32>, default_quality: u8) -> u8 {
    percent
        .map(|q| q.clamp(0, 100) as u8)
        .unwrap_or(default_quality)
        .clamp(1, 100)
}

/// Base file name without extension, with the naming rule applied.
///
/// Prefix and suffix consisting only of whitespace are ignored.
pub fn output_base_name(source_name: &str, naming: Option<&NamingRule>) -> String {
    let stem = strip_extension(source_name);
    let stem = if stem.is_empty() { "image" } else { stem };

    let non_blank = |value: Option<&String>| {
        value
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .unwrap_or_default()
    };
    let prefix = non_blank(naming.and_then(|n| n.prefix.as_ref()));
    let suffix = non_blank(naming.and_then(|n| n.suffix.as_ref()));

    format!("{}{}{}", prefix, stem, suffix)
}

fn strip_extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// First free path among `base.ext`, `base-1.ext`, `base-2.ext`, ...
///
/// The check runs against the directory as it is now; it is not synchronized
/// with other writers to the same directory.
pub fn next_available_path(dir: &Path, base: &str, format: OutputFormat) -> PathBuf {
    let ext = format.extension();
    let mut candidate = dir.join(format!("{}.{}", base, ext));
    let mut index = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{}-{}.{}", base, index, ext));
        index += 1;
    }
    candidate
}

/// Composite onto an opaque white background and drop alpha
pub fn flatten_on_white(image: &RgbaImage) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let px = image.get_pixel(x, y);
        let alpha = px[3] as f32 / 255.0;
        let channel = |c: u8| (c as f32 * alpha + 255.0 * (1.0 - alpha)).round() as u8;
        image::Rgb([channel(px[0]), channel(px[1]), channel(px[2])])
    })
}

/// Encode a composited raster. `has_alpha` tells whether the source carried an
/// alpha channel; PNG output keeps it, JPEG output is flattened on white.
pub fn encode_image(image: &RgbaImage, has_alpha: bool, options: &EncodeOptions) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let (width, height) = image.dimensions();

    match options.format {
        OutputFormat::Png if has_alpha => PngEncoder::new(&mut buffer)
            .write_image(image.as_raw(), width, height, ExtendedColorType::Rgba8)
            .map_err(ExportError::Encode)?,
        OutputFormat::Png => {
            let rgb = flatten_on_white(image);
            PngEncoder::new(&mut buffer)
                .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
                .map_err(ExportError::Encode)?
        }
        OutputFormat::Jpeg => {
            let rgb = flatten_on_white(image);
            JpegEncoder::new_with_quality(&mut buffer, options.jpeg_quality)
                .write_image(rgb.as_raw(), width, height, ExtendedColorType::Rgb8)
                .map_err(ExportError::Encode)?
        }
    }

    Ok(buffer)
}

/// Writes encoded outputs into one job's output directory
#[derive(Debug, Clone)]
pub struct OutputWriter {
    directory: PathBuf,
    options: EncodeOptions,
    naming: Option<NamingRule>,
}

impl OutputWriter {
    pub fn new(directory: impl Into<PathBuf>, policy: &ExportPolicy, default_quality: u8) -> Self {
        Self {
            directory: directory.into(),
            options: EncodeOptions::for_policy(policy, default_quality),
            naming: policy.naming.clone(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn options(&self) -> &EncodeOptions {
        &self.options
    }

    /// Resolve a free name for `source_name`, encode and write. Returns the
    /// output file name.
    pub fn write(&self, source_name: &str, image: &RgbaImage, has_alpha: bool) -> Result<String> {
        let encoded = encode_image(image, has_alpha, &self.options)?;
        let base = output_base_name(source_name, self.naming.as_ref());
        let path = next_available_path(&self.directory, &base, self.options.format);

        std::fs::write(&path, &encoded)?;
        debug!("Wrote {} bytes to {:?}", encoded.len(), path);

        Ok(path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or(base))
    }
}
