//! Watermark compositing: text and embedded-image overlays onto an RGBA raster
//!
//! Malformed watermark input never fails a file. Bad base64, unreadable
//! overlay images and empty text all degrade to "no watermark".

use crate::color::{parse_hex_color, BLACK, SHADOW_BLACK, WHITE};
use crate::fonts::{FontCatalog, FontStyle};
use crate::layout::{Anchor, PositionCalculator};
use crate::models::{ImageWatermark, LayoutSpec, TextWatermark, WatermarkKind, WatermarkSpec};
use ab_glyph::{point, Font, FontArc, GlyphId, OutlinedGlyph, PxScale, ScaleFont};
use base64::Engine as _;
use image::{imageops, Rgba, RgbaImage};
use std::sync::Arc;

pub const DEFAULT_FONT_SIZE: u32 = 32;
/// Lower bound applied when a layout scale shrinks the font
pub const MIN_SCALED_FONT_SIZE: f64 = 8.0;
pub const DEFAULT_OPACITY: f32 = 0.8;
pub const DEFAULT_SHADOW_OFFSET: f64 = 2.0;
pub const DEFAULT_IMAGE_SCALE: f64 = 0.3;
pub const MIN_IMAGE_SCALE: f64 = 0.05;
pub const MAX_IMAGE_SCALE: f64 = 1.0;

/// Composites watermarks using fonts from a catalog
#[derive(Clone)]
pub struct WatermarkEngine {
    fonts: Arc<dyn FontCatalog>,
}

impl WatermarkEngine {
    pub fn new(fonts: Arc<dyn FontCatalog>) -> Self {
        Self { fonts }
    }

    pub fn fonts(&self) -> &Arc<dyn FontCatalog> {
        &self.fonts
    }

    /// Apply a watermark spec in place. `None` leaves the target untouched.
    pub fn apply(&self, target: &mut RgbaImage, spec: Option<&WatermarkSpec>) {
        let Some(spec) = spec else {
            return;
        };
        let layout = spec.layout.as_ref();
        match &spec.kind {
            WatermarkKind::Text { text } => self.apply_text(target, text, layout),
            WatermarkKind::Image { image } => self.apply_image(target, image, layout),
        }
    }

    /// Draw shadow, stroke and fill layers (back to front) centred on the anchor.
    pub fn apply_text(&self, target: &mut RgbaImage, text: &TextWatermark, layout: Option<&LayoutSpec>) {
        let content = text.content.as_str();
        if content.trim().is_empty() {
            return;
        }

        let style = FontStyle::from_flags(text.bold, text.italic);
        let font = self.fonts.resolve(text.font_family.as_deref(), style);
        let font_size = resolve_font_size(text, layout);
        let scale = px_scale_for(&font, font_size);
        let ascent = font.as_scaled(scale).ascent() as f64;
        let text_width = measure_text_width(&font, scale, content) as f64;

        let anchor = PositionCalculator::resolve_anchor(layout, target.width(), target.height());
        let placement = Placement {
            anchor,
            origin_x: anchor.x - text_width / 2.0,
            origin_y: anchor.y + ascent / 2.0,
            rotation: PositionCalculator::rotation_radians(layout).map(|r| (r.sin(), r.cos())),
        };
        let opacity = resolve_opacity(text.opacity);

        let stroke_width = resolve_stroke_width(text, font_size);
        let padding = stroke_width
            .map_or(0, |w| (w / 2.0).ceil() as i32)
            .saturating_add(3);

        let Some(fill) = CoverageMask::rasterize(&font, scale, content, padding) else {
            return;
        };

        if let Some(shadow) = &text.shadow {
            let color = parse_hex_color(shadow.color.as_deref(), SHADOW_BLACK);
            let offset = (
                shadow.offset_x.unwrap_or(DEFAULT_SHADOW_OFFSET),
                shadow.offset_y.unwrap_or(DEFAULT_SHADOW_OFFSET),
            );
            composite_mask(target, &fill, &placement, offset, color, opacity);
        }

        if let Some(width) = stroke_width {
            let color = parse_hex_color(text.stroke.as_ref().and_then(|s| s.color.as_deref()), BLACK);
            let outline = fill.outline(width);
            composite_mask(target, &outline, &placement, (0.0, 0.0), color, opacity);
        }

        let color = parse_hex_color(text.color.as_deref(), WHITE);
        composite_mask(target, &fill, &placement, (0.0, 0.0), color, opacity);
    }

    /// Decode the embedded overlay, scale it against the target width and
    /// alpha-blend it centred on the anchor.
    pub fn apply_image(&self, target: &mut RgbaImage, image: &ImageWatermark, layout: Option<&LayoutSpec>) {
        let Some(overlay) = decode_embedded_image(&image.data) else {
            return;
        };
        let Some((width, height)) =
            image_watermark_size(target.width(), overlay.width(), overlay.height(), image.scale)
        else {
            return;
        };

        let scaled = imageops::resize(&overlay, width, height, imageops::FilterType::CatmullRom);
        let anchor = PositionCalculator::resolve_anchor(layout, target.width(), target.height());
        let x = (anchor.x - width as f64 / 2.0).round() as i64;
        let y = (anchor.y - height as f64 / 2.0).round() as i64;

        blend_layer(target, &scaled, x, y, resolve_opacity(image.opacity));
    }
}

/// Opacity percentage to a [0, 1] factor, defaulting to 0.8
pub fn resolve_opacity(percent: Option<f64>) -> f32 {
    percent
        .filter(|p| p.is_finite())
        .map(|p| (p / 100.0) as f32)
        .unwrap_or(DEFAULT_OPACITY)
        .clamp(0.0, 1.0)
}

/// Font size in pixels: default 32, multiplied by the layout scale when present
/// and then floored at 8.
pub fn resolve_font_size(text: &TextWatermark, layout: Option<&LayoutSpec>) -> f32 {
    let base = text.font_size.filter(|s| *s > 0).unwrap_or(DEFAULT_FONT_SIZE) as f64;
    match layout.and_then(|l| l.scale).filter(|s| s.is_finite()) {
        Some(scale) => (base * scale).round().max(MIN_SCALED_FONT_SIZE) as f32,
        None => base as f32,
    }
}

/// Stroke width in pixels, `None` unless positive. Capped at the font size.
pub fn resolve_stroke_width(text: &TextWatermark, font_size: f32) -> Option<f32> {
    text.stroke
        .as_ref()
        .and_then(|stroke| stroke.width)
        .filter(|w| w.is_finite() && *w > 0.0)
        .map(|w| (w as f32).min(font_size.max(1.0)))
}

/// Scaled overlay size: width is a fraction of the target width, height keeps
/// the overlay's own aspect ratio. `None` when either side rounds to zero.
pub fn image_watermark_size(
    target_width: u32,
    overlay_width: u32,
    overlay_height: u32,
    scale: Option<f64>,
) -> Option<(u32, u32)> {
    if overlay_width == 0 || overlay_height == 0 {
        return None;
    }
    let scale = scale
        .filter(|s| s.is_finite())
        .unwrap_or(DEFAULT_IMAGE_SCALE)
        .clamp(MIN_IMAGE_SCALE, MAX_IMAGE_SCALE);

    let width = (target_width as f64 * scale).round();
    if width < 1.0 {
        return None;
    }
    let height = (overlay_height as f64 * (width / overlay_width as f64)).round();
    if height < 1.0 {
        return None;
    }
    Some((width as u32, height as u32))
}

/// Strip an optional data-URI prefix (up to the first comma), base64-decode
/// and decode the image.
pub fn decode_embedded_image(data: &str) -> Option<RgbaImage> {
    if data.trim().is_empty() {
        return None;
    }
    let payload = match data.find(',') {
        Some(idx) => &data[idx + 1..],
        None => data,
    };

    let bytes = match base64::engine::general_purpose::STANDARD.decode(payload.trim()) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::debug!("Skipping image watermark with invalid base64: {}", e);
            return None;
        }
    };

    match image::load_from_memory(&bytes) {
        Ok(decoded) => Some(decoded.to_rgba8()),
        Err(e) => {
            tracing::debug!("Skipping unreadable image watermark: {}", e);
            None
        }
    }
}

/// Porter-Duff "over" with an extra uniform opacity on the foreground
pub fn blend_pixels(background: Rgba<u8>, foreground: Rgba<u8>, opacity: f32) -> Rgba<u8> {
    let fg_alpha = (foreground[3] as f32 / 255.0) * opacity.clamp(0.0, 1.0);
    let bg_alpha = background[3] as f32 / 255.0;
    let out_alpha = fg_alpha + bg_alpha * (1.0 - fg_alpha);

    if out_alpha < 0.001 {
        return Rgba([0, 0, 0, 0]);
    }

    let channel = |fg: u8, bg: u8| -> u8 {
        let fg = fg as f32 / 255.0;
        let bg = bg as f32 / 255.0;
        let result = (fg * fg_alpha + bg * bg_alpha * (1.0 - fg_alpha)) / out_alpha;
        (result * 255.0).round().clamp(0.0, 255.0) as u8
    };

    Rgba([
        channel(foreground[0], background[0]),
        channel(foreground[1], background[1]),
        channel(foreground[2], background[2]),
        (out_alpha * 255.0).round() as u8,
    ])
}

/// Blend an overlay at an integer offset, clipped to the target bounds
fn blend_layer(target: &mut RgbaImage, overlay: &RgbaImage, x: i64, y: i64, opacity: f32) {
    let x_start = x.max(0);
    let y_start = y.max(0);
    let x_end = (x + overlay.width() as i64).min(target.width() as i64);
    let y_end = (y + overlay.height() as i64).min(target.height() as i64);

    for ty in y_start..y_end {
        for tx in x_start..x_end {
            let fg = *overlay.get_pixel((tx - x) as u32, (ty - y) as u32);
            let pixel = target.get_pixel_mut(tx as u32, ty as u32);
            *pixel = blend_pixels(*pixel, fg, opacity);
        }
    }
}

/// Pixel scale whose em square matches `size` pixels
fn px_scale_for(font: &FontArc, size: f32) -> PxScale {
    match font.units_per_em() {
        Some(units) if units > 0.0 => PxScale::from(size * font.height_unscaled() / units),
        _ => PxScale::from(size),
    }
}

/// Advance width of `text` including kerning
pub fn measure_text_width(font: &FontArc, scale: PxScale, text: &str) -> f32 {
    let scaled = font.as_scaled(scale);
    let mut width = 0.0f32;
    let mut previous: Option<GlyphId> = None;
    for c in text.chars() {
        let id = scaled.glyph_id(c);
        if let Some(prev) = previous {
            width += scaled.kern(prev, id);
        }
        width += scaled.h_advance(id);
        previous = Some(id);
    }
    width
}

/// Where text-local coordinates land on the target. Local x runs from the
/// text's left edge, local y from the baseline.
struct Placement {
    anchor: Anchor,
    origin_x: f64,
    origin_y: f64,
    /// (sin, cos) of the rotation about the anchor
    rotation: Option<(f64, f64)>,
}

impl Placement {
    fn to_target(&self, lx: f64, ly: f64, offset: (f64, f64)) -> (f64, f64) {
        let px = self.origin_x + offset.0 + lx;
        let py = self.origin_y + offset.1 + ly;
        match self.rotation {
            None => (px, py),
            Some((sin, cos)) => {
                let (dx, dy) = (px - self.anchor.x, py - self.anchor.y);
                (
                    self.anchor.x + dx * cos - dy * sin,
                    self.anchor.y + dx * sin + dy * cos,
                )
            }
        }
    }

    fn to_local(&self, tx: f64, ty: f64, offset: (f64, f64)) -> (f64, f64) {
        let (px, py) = match self.rotation {
            None => (tx, ty),
            Some((sin, cos)) => {
                let (dx, dy) = (tx - self.anchor.x, ty - self.anchor.y);
                (
                    self.anchor.x + dx * cos + dy * sin,
                    self.anchor.y - dx * sin + dy * cos,
                )
            }
        };
        (px - self.origin_x - offset.0, py - self.origin_y - offset.1)
    }
}

/// Anti-aliased glyph coverage in text-local pixel space
#[derive(Debug, Clone)]
struct CoverageMask {
    left: i32,
    top: i32,
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl CoverageMask {
    fn empty(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
            data: vec![0.0; width as usize * height as usize],
        }
    }

    fn rasterize(font: &FontArc, scale: PxScale, text: &str, padding: i32) -> Option<Self> {
        let scaled = font.as_scaled(scale);
        let mut outlines: Vec<OutlinedGlyph> = Vec::new();
        let mut cursor = 0.0f32;
        let mut previous: Option<GlyphId> = None;

        for c in text.chars() {
            let id = scaled.glyph_id(c);
            if let Some(prev) = previous {
                cursor += scaled.kern(prev, id);
            }
            if let Some(outlined) = font.outline_glyph(id.with_scale_and_position(scale, point(cursor, 0.0))) {
                outlines.push(outlined);
            }
            cursor += scaled.h_advance(id);
            previous = Some(id);
        }

        let bounds = outlines.iter().map(|o| o.px_bounds()).reduce(|a, b| ab_glyph::Rect {
            min: point(a.min.x.min(b.min.x), a.min.y.min(b.min.y)),
            max: point(a.max.x.max(b.max.x), a.max.y.max(b.max.y)),
        })?;

        let left = bounds.min.x.floor() as i32 - padding;
        let top = bounds.min.y.floor() as i32 - padding;
        let right = bounds.max.x.ceil() as i32 + padding;
        let bottom = bounds.max.y.ceil() as i32 + padding;
        let mut mask = Self::empty(left, top, (right - left).max(1) as u32, (bottom - top).max(1) as u32);

        for outlined in &outlines {
            let glyph_bounds = outlined.px_bounds();
            let (gx, gy) = (glyph_bounds.min.x as i32, glyph_bounds.min.y as i32);
            outlined.draw(|x, y, coverage| mask.accumulate(gx + x as i32, gy + y as i32, coverage));
        }
        Some(mask)
    }

    fn index(&self, ix: i32, iy: i32) -> Option<usize> {
        if ix < 0 || iy < 0 || ix >= self.width as i32 || iy >= self.height as i32 {
            return None;
        }
        Some(iy as usize * self.width as usize + ix as usize)
    }

    fn at(&self, ix: i32, iy: i32) -> f32 {
        self.index(ix, iy).map(|i| self.data[i]).unwrap_or(0.0)
    }

    fn accumulate(&mut self, x: i32, y: i32, coverage: f32) {
        if let Some(i) = self.index(x - self.left, y - self.top) {
            self.data[i] = (self.data[i] + coverage).min(1.0);
        }
    }

    /// Bilinear coverage at a local point, zero outside the mask
    fn sample(&self, lx: f64, ly: f64) -> f32 {
        let u = lx - self.left as f64 - 0.5;
        let v = ly - self.top as f64 - 0.5;
        let (x0, y0) = (u.floor(), v.floor());
        let (fx, fy) = ((u - x0) as f32, (v - y0) as f32);
        let (x0, y0) = (x0 as i32, y0 as i32);

        self.at(x0, y0) * (1.0 - fx) * (1.0 - fy)
            + self.at(x0 + 1, y0) * fx * (1.0 - fy)
            + self.at(x0, y0 + 1) * (1.0 - fx) * fy
            + self.at(x0 + 1, y0 + 1) * fx * fy
    }

    /// Band of `width` pixels centred on the glyph boundary, anti-aliased at
    /// both edges. Linear in the mask area regardless of width.
    fn outline(&self, width: f32) -> Self {
        let radius = width / 2.0;
        let inside: Vec<bool> = self.data.iter().map(|c| *c >= 0.5).collect();
        let to_inside = chamfer_distance(&inside, self.width, self.height, true);
        let to_outside = chamfer_distance(&inside, self.width, self.height, false);

        let mut out = Self::empty(self.left, self.top, self.width, self.height);
        for (i, value) in out.data.iter_mut().enumerate() {
            // Pixel centres sit half a pixel from the boundary they touch.
            let edge_distance = if inside[i] { to_outside[i] } else { to_inside[i] } - 0.5;
            *value = (radius - edge_distance + 0.5).clamp(0.0, 1.0);
        }
        out
    }
}

/// Two-pass chamfer distance (1, sqrt 2) from every pixel to the nearest pixel
/// whose `inside` flag equals `target`. Pixels beyond the mask count as outside.
fn chamfer_distance(inside: &[bool], width: u32, height: u32, target: bool) -> Vec<f32> {
    const DIAGONAL: f32 = std::f32::consts::SQRT_2;
    let (w, h) = (width as usize, height as usize);
    let far = (w + h) as f32 + 1.0;
    // Off-mask neighbours are outside pixels
    let border = if target { far } else { 0.0 };

    let mut dist: Vec<f32> = inside
        .iter()
        .map(|flag| if *flag == target { 0.0 } else { far })
        .collect();
    let at = |dist: &[f32], x: isize, y: isize, step: f32| -> f32 {
        if x < 0 || y < 0 || x >= w as isize || y >= h as isize {
            border + step
        } else {
            dist[y as usize * w + x as usize] + step
        }
    };

    for y in 0..h as isize {
        for x in 0..w as isize {
            let i = y as usize * w + x as usize;
            let best = at(&dist, x - 1, y, 1.0)
                .min(at(&dist, x, y - 1, 1.0))
                .min(at(&dist, x - 1, y - 1, DIAGONAL))
                .min(at(&dist, x + 1, y - 1, DIAGONAL));
            dist[i] = dist[i].min(best);
        }
    }
    for y in (0..h as isize).rev() {
        for x in (0..w as isize).rev() {
            let i = y as usize * w + x as usize;
            let best = at(&dist, x + 1, y, 1.0)
                .min(at(&dist, x, y + 1, 1.0))
                .min(at(&dist, x + 1, y + 1, DIAGONAL))
                .min(at(&dist, x - 1, y + 1, DIAGONAL));
            dist[i] = dist[i].min(best);
        }
    }
    dist
}

/// Blend a coverage mask in a solid color through the placement transform
fn composite_mask(
    target: &mut RgbaImage,
    mask: &CoverageMask,
    placement: &Placement,
    offset: (f64, f64),
    color: Rgba<u8>,
    opacity: f32,
) {
    let (left, top) = (mask.left as f64, mask.top as f64);
    let (right, bottom) = (left + mask.width as f64, top + mask.height as f64);
    let corners = [(left, top), (right, top), (left, bottom), (right, bottom)]
        .map(|(x, y)| placement.to_target(x, y, offset));

    let min_x = corners.iter().map(|c| c.0).fold(f64::INFINITY, f64::min).floor().max(0.0);
    let min_y = corners.iter().map(|c| c.1).fold(f64::INFINITY, f64::min).floor().max(0.0);
    let max_x = corners
        .iter()
        .map(|c| c.0)
        .fold(f64::NEG_INFINITY, f64::max)
        .ceil()
        .min(target.width() as f64);
    let max_y = corners
        .iter()
        .map(|c| c.1)
        .fold(f64::NEG_INFINITY, f64::max)
        .ceil()
        .min(target.height() as f64);
    if min_x >= max_x || min_y >= max_y {
        return;
    }

    let solid = Rgba([color[0], color[1], color[2], 255]);
    let color_alpha = color[3] as f32 / 255.0 * opacity;

    for ty in min_y as u32..max_y as u32 {
        for tx in min_x as u32..max_x as u32 {
            let (lx, ly) = placement.to_local(tx as f64 + 0.5, ty as f64 + 0.5, offset);
            let coverage = mask.sample(lx, ly);
            if coverage <= 0.0 {
                continue;
            }
            let pixel = target.get_pixel_mut(tx, ty);
            *pixel = blend_pixels(*pixel, solid, coverage * color_alpha);
        }
    }
}
