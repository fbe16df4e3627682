//! Anchor resolution: maps a layout spec to the pixel point the watermark is centred on

use crate::models::LayoutSpec;

/// Relative anchor used when neither a preset nor coordinates are given
pub const DEFAULT_ANCHOR: (f64, f64) = (0.5, 0.85);

/// Nine fixed anchor presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnchorPreset {
    TopLeft,
    TopCenter,
    TopRight,
    CenterLeft,
    Center,
    CenterRight,
    BottomLeft,
    BottomCenter,
    BottomRight,
}

impl AnchorPreset {
    pub const ALL: [AnchorPreset; 9] = [
        AnchorPreset::TopLeft,
        AnchorPreset::TopCenter,
        AnchorPreset::TopRight,
        AnchorPreset::CenterLeft,
        AnchorPreset::Center,
        AnchorPreset::CenterRight,
        AnchorPreset::BottomLeft,
        AnchorPreset::BottomCenter,
        AnchorPreset::BottomRight,
    ];

    /// Look up a preset by its kebab-case name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            AnchorPreset::TopLeft => "top-left",
            AnchorPreset::TopCenter => "top-center",
            AnchorPreset::TopRight => "top-right",
            AnchorPreset::CenterLeft => "center-left",
            AnchorPreset::Center => "center",
            AnchorPreset::CenterRight => "center-right",
            AnchorPreset::BottomLeft => "bottom-left",
            AnchorPreset::BottomCenter => "bottom-center",
            AnchorPreset::BottomRight => "bottom-right",
        }
    }

    /// Relative (x, y) in [0, 1]
    pub fn relative(&self) -> (f64, f64) {
        match self {
            AnchorPreset::TopLeft => (0.10, 0.15),
            AnchorPreset::TopCenter => (0.50, 0.15),
            AnchorPreset::TopRight => (0.90, 0.15),
            AnchorPreset::CenterLeft => (0.15, 0.50),
            AnchorPreset::Center => (0.50, 0.50),
            AnchorPreset::CenterRight => (0.85, 0.50),
            AnchorPreset::BottomLeft => (0.15, 0.85),
            AnchorPreset::BottomCenter => (0.50, 0.90),
            AnchorPreset::BottomRight => (0.85, 0.90),
        }
    }
}

/// Absolute anchor in pixels. Always the centre of the watermark's bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub x: f64,
    pub y: f64,
}

/// Resolves layout specs into pixel anchors
pub struct PositionCalculator;

impl PositionCalculator {
    /// Relative anchor for a layout: preset overrides the default on both axes,
    /// then explicit x and y each override their own axis, clamped to [0, 1].
    pub fn relative_anchor(layout: Option<&LayoutSpec>) -> (f64, f64) {
        let Some(layout) = layout else {
            return DEFAULT_ANCHOR;
        };

        let (mut x, mut y) = layout
            .preset
            .as_deref()
            .and_then(AnchorPreset::from_name)
            .map(|preset| preset.relative())
            .unwrap_or(DEFAULT_ANCHOR);

        if let Some(explicit) = layout.x.filter(|v| v.is_finite()) {
            x = explicit.clamp(0.0, 1.0);
        }
        if let Some(explicit) = layout.y.filter(|v| v.is_finite()) {
            y = explicit.clamp(0.0, 1.0);
        }

        (x, y)
    }

    pub fn resolve_anchor(layout: Option<&LayoutSpec>, width: u32, height: u32) -> Anchor {
        let (rx, ry) = Self::relative_anchor(layout);
        Anchor {
            x: rx * width as f64,
            y: ry * height as f64,
        }
    }

    /// Rotation in radians, if the layout asks for a non-zero one
    pub fn rotation_radians(layout: Option<&LayoutSpec>) -> Option<f64> {
        layout
            .and_then(|l| l.rotation_deg)
            .filter(|deg| deg.is_finite() && *deg != 0.0)
            .map(f64::to_radians)
    }
}
