//! Hex color parsing with lenient fallback

use image::Rgba;

pub const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
pub const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
/// Translucent black used for text shadows
pub const SHADOW_BLACK: Rgba<u8> = Rgba([0, 0, 0, 102]);

/// Parse `#RRGGBB` or `#AARRGGBB` (alpha first). The `#` is optional and
/// surrounding whitespace is ignored. Anything else yields `fallback`.
pub fn parse_hex_color(value: Option<&str>, fallback: Rgba<u8>) -> Rgba<u8> {
    let Some(raw) = value else {
        return fallback;
    };
    let trimmed = raw.trim();
    let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return fallback;
    }

    let byte = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();

    let parsed = match hex.len() {
        6 => byte(0..2)
            .zip(byte(2..4))
            .zip(byte(4..6))
            .map(|((r, g), b)| Rgba([r, g, b, 255])),
        8 => byte(0..2)
            .zip(byte(2..4))
            .zip(byte(4..6))
            .zip(byte(6..8))
            .map(|(((a, r), g), b)| Rgba([r, g, b, a])),
        _ => None,
    };

    parsed.unwrap_or(fallback)
}
