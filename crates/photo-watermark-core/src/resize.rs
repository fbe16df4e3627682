//! Aspect-preserving resize applied before watermarking

use crate::models::{ResizeMode, ResizePolicy};
use image::{imageops::FilterType, DynamicImage, GenericImageView};

/// Smooth bicubic-equivalent resampling filter
pub const RESAMPLE_FILTER: FilterType = FilterType::CatmullRom;

/// Compute target dimensions for a resize policy.
///
/// A missing policy, an unrecognized mode, or a mode whose parameter is
/// absent (or non-positive for width/height) leaves the dimensions unchanged.
/// Both results are floored at 1.
pub fn target_dimensions(policy: Option<&ResizePolicy>, width: u32, height: u32) -> (u32, u32) {
    let (src_w, src_h) = (width as f64, height as f64);

    let (target_w, target_h) = match policy {
        Some(ResizePolicy {
            mode: ResizeMode::ByWidth,
            width: Some(w),
            ..
        }) if *w > 0 => {
            let w = *w as f64;
            (w, (src_h * (w / src_w)).round())
        }
        Some(ResizePolicy {
            mode: ResizeMode::ByHeight,
            height: Some(h),
            ..
        }) if *h > 0 => {
            let h = *h as f64;
            ((src_w * (h / src_h)).round(), h)
        }
        Some(ResizePolicy {
            mode: ResizeMode::ByPercent,
            percent: Some(pct),
            ..
        }) if pct.is_finite() => (
            (src_w * pct / 100.0).round(),
            (src_h * pct / 100.0).round(),
        ),
        _ => (src_w, src_h),
    };

    (to_dimension(target_w), to_dimension(target_h))
}

fn to_dimension(value: f64) -> u32 {
    value.clamp(1.0, u32::MAX as f64) as u32
}

/// Resize the image according to the policy. Returns the input untouched when
/// the target matches the source; otherwise resamples into a new raster with
/// the same color type, so alpha presence is preserved.
pub fn apply_resize(image: DynamicImage, policy: Option<&ResizePolicy>) -> DynamicImage {
    let (width, height) = image.dimensions();
    let (target_w, target_h) = target_dimensions(policy, width, height);
    if (target_w, target_h) == (width, height) {
        return image;
    }

    tracing::debug!(
        "Resizing {}x{} -> {}x{}",
        width,
        height,
        target_w,
        target_h
    );
    image.resize_exact(target_w, target_h, RESAMPLE_FILTER)
}
