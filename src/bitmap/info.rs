//! Bitmap geometry and pixel-format descriptor.
//!
//! A `BitmapInfo` is a pure function of a source image and a `TargetSize`.
//! Rows are tightly packed: `bytes_per_row == bits_per_pixel * width / 8`.

use image::{ColorType, DynamicImage};
use serde::{Deserialize, Serialize};

use crate::error::{RasterError, RasterResult};

/// Byte layout of a raw pixel buffer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorLayout {
    /// 8-bit R, G, B, no alpha (24 bpp).
    Rgb888,
    /// 8-bit R, G, B, straight alpha last (32 bpp).
    Rgba8888,
    /// 8-bit alpha first, then premultiplied R, G, B (32 bpp).
    PremultipliedArgb8888,
    /// 16 bpp big-endian word, top bit unused, then 5-bit R, G, B.
    Rgb555,
}

impl ColorLayout {
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            ColorLayout::Rgb888 => 24,
            ColorLayout::Rgba8888 | ColorLayout::PremultipliedArgb8888 => 32,
            ColorLayout::Rgb555 => 16,
        }
    }

    pub fn bits_per_component(self) -> u32 {
        match self {
            ColorLayout::Rgb555 => 5,
            _ => 8,
        }
    }

    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            ColorLayout::Rgba8888 | ColorLayout::PremultipliedArgb8888
        )
    }

    /// Layout for a decoded source.
    ///
    /// 8-bit RGB-family sources keep their layout; everything else (gray,
    /// 16-bit, float) is normalized to premultiplied ARGB.
    pub fn for_color_type(color: ColorType) -> Self {
        match color {
            ColorType::Rgb8 => ColorLayout::Rgb888,
            ColorType::Rgba8 => ColorLayout::Rgba8888,
            _ => ColorLayout::PremultipliedArgb8888,
        }
    }
}

/// How large the decoded bitmap should be.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetSize {
    /// Keep the source dimensions.
    Full,
    /// Scale uniformly so the width becomes this many pixels.
    /// Never upscales: a width at or above the source width means `Full`.
    WidthScaledTo(u32),
}

impl Default for TargetSize {
    fn default() -> Self {
        TargetSize::Full
    }
}

impl TargetSize {
    /// Resolve to concrete `(width, height)` for a source of the given size.
    ///
    /// Width is the ceiling of the scaled width, height the scaled height
    /// rounded to nearest (half up). Integer arithmetic keeps
    /// `WidthScaledTo(w)` landing exactly on `w`.
    pub fn resolve(self, source_width: u32, source_height: u32) -> (u32, u32) {
        match self {
            TargetSize::WidthScaledTo(w) if w > 0 && w < source_width => {
                let (sw, sh, w) = (source_width as u64, source_height as u64, w as u64);
                let width = (sw * w + sw - 1) / sw;
                let height = (2 * sh * w + sw) / (2 * sw);
                (width as u32, height.max(1) as u32)
            }
            _ => (source_width, source_height),
        }
    }
}

/// Immutable geometry + pixel format of a raw bitmap.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapInfo {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    pub bits_per_component: u32,
    pub layout: ColorLayout,
}

impl BitmapInfo {
    pub fn new(width: u32, height: u32, layout: ColorLayout) -> RasterResult<Self> {
        if width == 0 || height == 0 {
            return Err(RasterError::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            bits_per_pixel: layout.bits_per_pixel(),
            bits_per_component: layout.bits_per_component(),
            layout,
        })
    }

    /// Geometry for drawing `source` at `target`.
    pub fn for_image(source: &DynamicImage, target: TargetSize) -> RasterResult<Self> {
        Self::for_source(
            source.width(),
            source.height(),
            ColorLayout::for_color_type(source.color()),
            target,
        )
    }

    pub fn for_source(
        source_width: u32,
        source_height: u32,
        layout: ColorLayout,
        target: TargetSize,
    ) -> RasterResult<Self> {
        if source_width == 0 || source_height == 0 {
            return Err(RasterError::InvalidDimensions {
                width: source_width,
                height: source_height,
            });
        }
        let (width, height) = target.resolve(source_width, source_height);
        Self::new(width, height, layout)
    }

    pub fn bytes_per_row(&self) -> usize {
        self.bits_per_pixel as usize * self.width as usize / 8
    }

    pub fn buffer_length(&self) -> usize {
        self.bytes_per_row() * self.height as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_scaled_matches_requested_width() {
        let info = BitmapInfo::for_source(2000, 1500, ColorLayout::Rgb888, TargetSize::WidthScaledTo(100))
            .unwrap();
        assert_eq!(info.width, 100);
        assert_eq!(info.height, 75);
    }

    #[test]
    fn test_height_rounds_to_nearest() {
        // 1333 * 100 / 2000 = 66.65 -> 67
        let (w, h) = TargetSize::WidthScaledTo(100).resolve(2000, 1333);
        assert_eq!((w, h), (100, 67));
        // 1329 * 100 / 2000 = 66.45 -> 66
        let (_, h) = TargetSize::WidthScaledTo(100).resolve(2000, 1329);
        assert_eq!(h, 66);
    }

    #[test]
    fn test_width_at_or_above_source_is_full() {
        assert_eq!(TargetSize::WidthScaledTo(640).resolve(640, 480), (640, 480));
        assert_eq!(TargetSize::WidthScaledTo(4000).resolve(640, 480), (640, 480));
        assert_eq!(TargetSize::Full.resolve(640, 480), (640, 480));
    }

    #[test]
    fn test_extreme_aspect_keeps_one_row() {
        let (w, h) = TargetSize::WidthScaledTo(10).resolve(10_000, 3);
        assert_eq!((w, h), (10, 1));
    }

    #[test]
    fn test_stride_and_length() {
        let info = BitmapInfo::new(43, 57, ColorLayout::Rgb555).unwrap();
        assert_eq!(info.bytes_per_row(), 86);
        assert_eq!(info.buffer_length(), 86 * 57);

        let info = BitmapInfo::new(3, 2, ColorLayout::Rgb888).unwrap();
        assert_eq!(info.bytes_per_row(), 9);
        assert_eq!(info.buffer_length(), 18);
    }

    #[test]
    fn test_layout_normalization() {
        assert_eq!(ColorLayout::for_color_type(ColorType::Rgb8), ColorLayout::Rgb888);
        assert_eq!(ColorLayout::for_color_type(ColorType::Rgba8), ColorLayout::Rgba8888);
        assert_eq!(
            ColorLayout::for_color_type(ColorType::L8),
            ColorLayout::PremultipliedArgb8888
        );
        assert_eq!(
            ColorLayout::for_color_type(ColorType::Rgb16),
            ColorLayout::PremultipliedArgb8888
        );
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        assert!(BitmapInfo::new(0, 10, ColorLayout::Rgb888).is_err());
        assert!(BitmapInfo::for_source(10, 0, ColorLayout::Rgb888, TargetSize::Full).is_err());
    }
}
