//! Font catalog: system font discovery with an embedded sans-serif fallback
//!
//! Family names coming from watermark specs are display hints only. Anything
//! that cannot be resolved or loaded falls back to the embedded DejaVu Sans
//! faces instead of failing the export.

use crate::error::{ExportError, Result};
use ab_glyph::FontArc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const DEJAVU_SANS: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");
const DEJAVU_SANS_BOLD: &[u8] = include_bytes!("../assets/fonts/DejaVuSans-Bold.ttf");
const DEJAVU_SANS_OBLIQUE: &[u8] = include_bytes!("../assets/fonts/DejaVuSans-Oblique.ttf");
const DEJAVU_SANS_BOLD_OBLIQUE: &[u8] =
    include_bytes!("../assets/fonts/DejaVuSans-BoldOblique.ttf");

/// Display name of the embedded fallback family
pub const EMBEDDED_FAMILY: &str = "DejaVu Sans";

const GENERIC_FAMILIES: &[&str] = &["sansserif", "sans", "serif", "monospaced", "monospace", "dialog", "default"];

/// Maximum directory depth walked below each font root
const MAX_SCAN_DEPTH: usize = 5;

/// Font style derived from the bold/italic flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FontStyle {
    Regular,
    Bold,
    Italic,
    BoldItalic,
}

impl FontStyle {
    pub fn from_flags(bold: bool, italic: bool) -> Self {
        match (bold, italic) {
            (false, false) => FontStyle::Regular,
            (true, false) => FontStyle::Bold,
            (false, true) => FontStyle::Italic,
            (true, true) => FontStyle::BoldItalic,
        }
    }

    fn from_suffix(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "regular" | "book" | "roman" | "normal" => Some(FontStyle::Regular),
            "bold" | "bd" => Some(FontStyle::Bold),
            "italic" | "oblique" | "it" => Some(FontStyle::Italic),
            "bolditalic" | "boldoblique" | "bi" => Some(FontStyle::BoldItalic),
            _ => None,
        }
    }
}

/// Source of fonts for text watermarks
pub trait FontCatalog: Send + Sync {
    /// Known family display names, sorted case-insensitively
    fn families(&self) -> Vec<String>;

    /// Resolve a family and style to a loaded face. Never fails; unknown
    /// families resolve to the generic sans-serif fallback.
    fn resolve(&self, family: Option<&str>, style: FontStyle) -> FontArc;
}

/// The four embedded DejaVu Sans faces
#[derive(Clone)]
pub struct EmbeddedFonts {
    regular: FontArc,
    bold: FontArc,
    italic: FontArc,
    bold_italic: FontArc,
}

impl EmbeddedFonts {
    pub fn load() -> Result<Self> {
        let parse = |data: &'static [u8], face: &str| {
            FontArc::try_from_slice(data).map_err(|e| ExportError::Font {
                message: format!("embedded face {} is invalid: {}", face, e),
            })
        };

        Ok(Self {
            regular: parse(DEJAVU_SANS, "regular")?,
            bold: parse(DEJAVU_SANS_BOLD, "bold")?,
            italic: parse(DEJAVU_SANS_OBLIQUE, "oblique")?,
            bold_italic: parse(DEJAVU_SANS_BOLD_OBLIQUE, "bold-oblique")?,
        })
    }

    pub fn face(&self, style: FontStyle) -> FontArc {
        match style {
            FontStyle::Regular => self.regular.clone(),
            FontStyle::Bold => self.bold.clone(),
            FontStyle::Italic => self.italic.clone(),
            FontStyle::BoldItalic => self.bold_italic.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct FamilyFaces {
    display_name: String,
    files: HashMap<FontStyle, PathBuf>,
}

/// Catalog of `.ttf`/`.otf` files found in font directories
pub struct SystemFontCatalog {
    embedded: EmbeddedFonts,
    families: HashMap<String, FamilyFaces>,
    loaded: RwLock<HashMap<PathBuf, FontArc>>,
}

impl SystemFontCatalog {
    /// Catalog with only the embedded fallback family
    pub fn embedded_only() -> Result<Self> {
        Ok(Self {
            embedded: EmbeddedFonts::load()?,
            families: HashMap::new(),
            loaded: RwLock::new(HashMap::new()),
        })
    }

    /// Scan the platform font directories plus `extra_dirs`
    pub fn discover(extra_dirs: &[PathBuf]) -> Result<Self> {
        let mut roots = platform_font_dirs();
        roots.extend(extra_dirs.iter().cloned());
        Self::from_dirs(&roots)
    }

    /// Scan only the given directories
    pub fn from_dirs(roots: &[PathBuf]) -> Result<Self> {
        let mut catalog = Self::embedded_only()?;
        let mut files = Vec::new();
        for root in roots {
            collect_font_files(root, 0, &mut files);
        }

        for path in files {
            let Some((family, style)) = family_and_style(&path) else {
                continue;
            };
            let key = normalize_family(&family);
            if key.is_empty() {
                continue;
            }
            let entry = catalog.families.entry(key).or_insert_with(|| FamilyFaces {
                display_name: family.clone(),
                ..Default::default()
            });
            entry.files.entry(style).or_insert(path);
        }

        tracing::info!(
            "Font catalog initialized with {} families",
            catalog.families.len() + 1
        );
        Ok(catalog)
    }

    pub fn into_shared(self) -> Arc<dyn FontCatalog> {
        Arc::new(self)
    }

    fn load_file(&self, path: &Path) -> Option<FontArc> {
        let cached = self
            .loaded
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .cloned();
        if cached.is_some() {
            return cached;
        }

        let font = match std::fs::read(path).map(FontArc::try_from_vec) {
            Ok(Ok(font)) => font,
            Ok(Err(e)) => {
                tracing::warn!("Unusable font file {:?}: {}", path, e);
                return None;
            }
            Err(e) => {
                tracing::warn!("Failed to read font file {:?}: {}", path, e);
                return None;
            }
        };

        self.loaded
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_path_buf(), font.clone());
        Some(font)
    }
}

impl FontCatalog for SystemFontCatalog {
    fn families(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .families
            .values()
            .map(|faces| faces.display_name.clone())
            .collect();
        names.push(EMBEDDED_FAMILY.to_string());
        names.sort_by_key(|name| name.to_lowercase());
        names.dedup_by(|a, b| normalize_family(a) == normalize_family(b));
        names
    }

    fn resolve(&self, family: Option<&str>, style: FontStyle) -> FontArc {
        let key = family.map(normalize_family).unwrap_or_default();
        if key.is_empty() || GENERIC_FAMILIES.contains(&key.as_str()) {
            return self.embedded.face(style);
        }

        let path = self.families.get(&key).and_then(|faces| {
            faces
                .files
                .get(&style)
                .or_else(|| faces.files.get(&FontStyle::Regular))
                .or_else(|| faces.files.values().next())
        });

        match path.and_then(|p| self.load_file(p)) {
            Some(font) => font,
            None => {
                tracing::debug!("Font family {:?} unavailable, using {}", family, EMBEDDED_FAMILY);
                self.embedded.face(style)
            }
        }
    }
}

/// Lowercase alphanumerics only, so `DejaVu Sans` matches `DejaVuSans`
pub fn normalize_family(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn family_and_style(path: &Path) -> Option<(String, FontStyle)> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if ext != "ttf" && ext != "otf" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;

    if let Some(idx) = stem.rfind(['-', '_', ' ']) {
        let (family, suffix) = (&stem[..idx], &stem[idx + 1..]);
        if let Some(style) = FontStyle::from_suffix(suffix) {
            if !family.is_empty() {
                return Some((family.to_string(), style));
            }
        }
    }
    Some((stem.to_string(), FontStyle::Regular))
}

fn collect_font_files(dir: &Path, depth: usize, out: &mut Vec<PathBuf>) {
    if depth > MAX_SCAN_DEPTH {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => collect_font_files(&path, depth + 1, out),
            Ok(ft) if ft.is_file() => out.push(path),
            _ => {}
        }
    }
}

fn platform_font_dirs() -> Vec<PathBuf> {
    let mut dirs_found = Vec::new();
    if let Some(user_fonts) = dirs::font_dir() {
        dirs_found.push(user_fonts);
    }

    if cfg!(target_os = "windows") {
        let windir = std::env::var_os("WINDIR").unwrap_or_else(|| "C:\\Windows".into());
        dirs_found.push(PathBuf::from(windir).join("Fonts"));
    } else if cfg!(target_os = "macos") {
        dirs_found.push(PathBuf::from("/System/Library/Fonts"));
        dirs_found.push(PathBuf::from("/Library/Fonts"));
    } else {
        dirs_found.push(PathBuf::from("/usr/share/fonts"));
        dirs_found.push(PathBuf::from("/usr/local/share/fonts"));
        if let Some(home) = dirs::home_dir() {
            dirs_found.push(home.join(".fonts"));
        }
    }
    dirs_found
}
