//! Rasterizer boundary
//!
//! Everything that actually touches pixels goes through the `Rasterizer`
//! trait: decoding compressed bytes, drawing a source into a caller-owned
//! buffer, and wrapping raw bytes as a displayable `Image`. `ImageRasterizer`
//! is the default implementation on top of the `image` crate.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use image::{imageops::FilterType, DynamicImage, ImageDecoder, ImageReader, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::bitmap::info::{BitmapInfo, ColorLayout};
use crate::error::{RasterError, RasterResult};

/// Display orientation stored alongside pixels. The numeric values are the
/// ones written into preview headers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum Orientation {
    #[default]
    Up = 0,
    Down = 1,
    Left = 2,
    Right = 3,
    UpMirrored = 4,
    DownMirrored = 5,
    LeftMirrored = 6,
    RightMirrored = 7,
}

impl Orientation {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Orientation::Up,
            1 => Orientation::Down,
            2 => Orientation::Left,
            3 => Orientation::Right,
            4 => Orientation::UpMirrored,
            5 => Orientation::DownMirrored,
            6 => Orientation::LeftMirrored,
            7 => Orientation::RightMirrored,
            _ => return None,
        })
    }

    /// Map the EXIF orientation reported by a decoder.
    pub fn from_exif(orientation: image::metadata::Orientation) -> Self {
        use image::metadata::Orientation as Exif;
        match orientation {
            Exif::NoTransforms => Orientation::Up,
            Exif::Rotate180 => Orientation::Down,
            Exif::Rotate90 => Orientation::Right,
            Exif::Rotate270 => Orientation::Left,
            Exif::FlipHorizontal => Orientation::UpMirrored,
            Exif::FlipVertical => Orientation::DownMirrored,
            Exif::Rotate90FlipH => Orientation::LeftMirrored,
            Exif::Rotate270FlipH => Orientation::RightMirrored,
        }
    }
}

/// Zero-copy source of pixel bytes behind an `Image`.
///
/// Dropping the provider is the release hook: whatever it holds (an access
/// guard, a file mapping) is let go when the last `Image` clone goes away.
pub trait PixelProvider: Send + Sync {
    fn bytes(&self) -> &[u8];
}

impl PixelProvider for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }
}

/// A displayable image: raw pixels + layout + orientation + display scale.
///
/// Cloning is cheap and shares the same pixel provider.
#[derive(Clone)]
pub struct Image {
    provider: Arc<dyn PixelProvider>,
    info: BitmapInfo,
    orientation: Orientation,
    scale: f64,
}

impl Image {
    pub fn new(
        provider: Arc<dyn PixelProvider>,
        info: BitmapInfo,
        orientation: Orientation,
        scale: f64,
    ) -> RasterResult<Self> {
        let actual = provider.bytes().len();
        if actual < info.buffer_length() {
            return Err(RasterError::BufferSize {
                expected: info.buffer_length(),
                actual,
            });
        }
        Ok(Self {
            provider,
            info,
            orientation,
            scale,
        })
    }

    pub fn width(&self) -> u32 {
        self.info.width
    }

    pub fn height(&self) -> u32 {
        self.info.height
    }

    pub fn info(&self) -> &BitmapInfo {
        &self.info
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    /// Pixels per logical unit. Previews carry a scale below 1.0 so they
    /// present at the full image's size.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Logical size: pixel size divided by scale.
    pub fn size(&self) -> (f64, f64) {
        (
            self.info.width as f64 / self.scale,
            self.info.height as f64 / self.scale,
        )
    }

    pub fn bytes(&self) -> &[u8] {
        &self.provider.bytes()[..self.info.buffer_length()]
    }

    /// True when both images view the very same pixel provider.
    pub fn same_pixels(&self, other: &Image) -> bool {
        Arc::ptr_eq(&self.provider, &other.provider)
    }

    /// Expand the stored layout into straight RGBA8.
    pub fn to_rgba(&self) -> RgbaImage {
        let bytes = self.bytes();
        let mut out = Vec::with_capacity(self.info.width as usize * self.info.height as usize * 4);
        match self.info.layout {
            ColorLayout::Rgb888 => {
                for px in bytes.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
            }
            ColorLayout::Rgba8888 => out.extend_from_slice(bytes),
            ColorLayout::PremultipliedArgb8888 => {
                for px in bytes.chunks_exact(4) {
                    let a = px[0];
                    out.extend_from_slice(&[
                        unpremultiply(px[1], a),
                        unpremultiply(px[2], a),
                        unpremultiply(px[3], a),
                        a,
                    ]);
                }
            }
            ColorLayout::Rgb555 => {
                for px in bytes.chunks_exact(2) {
                    let word = u16::from_be_bytes([px[0], px[1]]);
                    out.extend_from_slice(&[
                        expand5((word >> 10) & 0x1f),
                        expand5((word >> 5) & 0x1f),
                        expand5(word & 0x1f),
                        255,
                    ]);
                }
            }
        }
        // Length is exact by construction.
        RgbaImage::from_raw(self.info.width, self.info.height, out)
            .unwrap_or_else(|| RgbaImage::new(self.info.width, self.info.height))
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("info", &self.info)
            .field("orientation", &self.orientation)
            .field("scale", &self.scale)
            .finish_non_exhaustive()
    }
}

/// A decoded, not yet downsampled image plus its EXIF orientation.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub pixels: DynamicImage,
    pub orientation: Orientation,
}

impl SourceImage {
    pub fn new(pixels: DynamicImage, orientation: Orientation) -> Self {
        Self {
            pixels,
            orientation,
        }
    }
}

/// The three pixel capabilities the cache and preview layers need.
pub trait Rasterizer: Send + Sync {
    /// Decode compressed bytes (JPEG, PNG, ...) into a source image.
    fn decode(&self, compressed: &[u8]) -> RasterResult<SourceImage>;

    /// Draw `source` into `dst`, scaled to `info`'s size, in `info`'s layout.
    fn draw(&self, source: &DynamicImage, info: &BitmapInfo, dst: &mut [u8]) -> RasterResult<()>;

    /// Wrap raw bytes as a displayable image without copying them.
    fn wrap(
        &self,
        provider: Arc<dyn PixelProvider>,
        info: BitmapInfo,
        orientation: Orientation,
        scale: f64,
    ) -> RasterResult<Image> {
        Image::new(provider, info, orientation, scale)
    }
}

/// `Rasterizer` backed by the `image` crate.
#[derive(Debug, Clone, Copy)]
pub struct ImageRasterizer {
    filter: FilterType,
}

impl Default for ImageRasterizer {
    fn default() -> Self {
        Self::new(FilterType::Triangle)
    }
}

impl ImageRasterizer {
    pub fn new(filter: FilterType) -> Self {
        Self { filter }
    }
}

impl Rasterizer for ImageRasterizer {
    fn decode(&self, compressed: &[u8]) -> RasterResult<SourceImage> {
        let mut decoder = ImageReader::new(Cursor::new(compressed))
            .with_guessed_format()?
            .into_decoder()?;
        let orientation = decoder
            .orientation()
            .map(Orientation::from_exif)
            .unwrap_or_default();
        let pixels = DynamicImage::from_decoder(decoder)?;
        Ok(SourceImage::new(pixels, orientation))
    }

    fn draw(&self, source: &DynamicImage, info: &BitmapInfo, dst: &mut [u8]) -> RasterResult<()> {
        if dst.len() != info.buffer_length() {
            return Err(RasterError::BufferSize {
                expected: info.buffer_length(),
                actual: dst.len(),
            });
        }

        let resized;
        let scaled = if source.width() == info.width && source.height() == info.height {
            source
        } else {
            resized = source.resize_exact(info.width, info.height, self.filter);
            &resized
        };

        match info.layout {
            ColorLayout::Rgb888 => dst.copy_from_slice(scaled.to_rgb8().as_raw()),
            ColorLayout::Rgba8888 => dst.copy_from_slice(scaled.to_rgba8().as_raw()),
            ColorLayout::PremultipliedArgb8888 => {
                let rgba = scaled.to_rgba8();
                for (out, px) in dst.chunks_exact_mut(4).zip(rgba.as_raw().chunks_exact(4)) {
                    let a = px[3];
                    out[0] = a;
                    out[1] = premultiply(px[0], a);
                    out[2] = premultiply(px[1], a);
                    out[3] = premultiply(px[2], a);
                }
            }
            ColorLayout::Rgb555 => {
                let rgb = scaled.to_rgb8();
                for (out, px) in dst.chunks_exact_mut(2).zip(rgb.as_raw().chunks_exact(3)) {
                    let word = ((px[0] as u16 >> 3) << 10)
                        | ((px[1] as u16 >> 3) << 5)
                        | (px[2] as u16 >> 3);
                    out.copy_from_slice(&word.to_be_bytes());
                }
            }
        }
        Ok(())
    }
}

fn premultiply(c: u8, a: u8) -> u8 {
    ((c as u32 * a as u32 + 127) / 255) as u8
}

fn unpremultiply(c: u8, a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    ((c as u32 * 255 + a as u32 / 2) / a as u32).min(255) as u8
}

fn expand5(v: u16) -> u8 {
    ((v << 3) | (v >> 2)) as u8
}
