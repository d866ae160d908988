//! Preview file format
//!
//! ```text
//! offset  size  field
//!      0     2  magic 0x5AEC
//!      2     2  full width   (original image)
//!      4     2  full height
//!      6     2  width        (stored pixels)
//!      8     2  height
//!     10     2  orientation
//!     12   2wh  RGB555 pixels, row-major, stride 2*width
//! ```
//!
//! All header fields are big-endian u16. A file is valid only when its
//! length is exactly `12 + 2 * width * height`.

use std::sync::Arc;

use image::DynamicImage;
use log::debug;

use crate::bitmap::info::{BitmapInfo, ColorLayout};
use crate::config::DEFAULT_PREVIEW_PIXEL_BUDGET;
use crate::error::{PreviewError, PreviewResult};
use crate::raster::{Image, Orientation, PixelProvider, Rasterizer};

pub const PREVIEW_MAGIC: u16 = 0x5AEC;
pub const HEADER_LEN: usize = 12;

/// Bytes per stored pixel (RGB555 in a 16-bit word).
const BYTES_PER_PIXEL: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewHeader {
    pub full_width: u16,
    pub full_height: u16,
    pub width: u16,
    pub height: u16,
    pub orientation: Orientation,
}

impl PreviewHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let fields = [
            PREVIEW_MAGIC,
            self.full_width,
            self.full_height,
            self.width,
            self.height,
            self.orientation.as_u16(),
        ];
        for (chunk, field) in out.chunks_exact_mut(2).zip(fields) {
            chunk.copy_from_slice(&field.to_be_bytes());
        }
        out
    }

    /// Parse and check the header fields. Does not check the total length.
    pub fn parse(bytes: &[u8]) -> PreviewResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(PreviewError::Truncated(bytes.len()));
        }
        let field = |i: usize| u16::from_be_bytes([bytes[2 * i], bytes[2 * i + 1]]);

        let magic = field(0);
        if magic != PREVIEW_MAGIC {
            return Err(PreviewError::BadMagic(magic));
        }
        let orientation =
            Orientation::from_u16(field(5)).ok_or(PreviewError::BadOrientation(field(5)))?;

        Ok(Self {
            full_width: field(1),
            full_height: field(2),
            width: field(3),
            height: field(4),
            orientation,
        })
    }

    pub fn pixel_len(&self) -> usize {
        BYTES_PER_PIXEL * self.width as usize * self.height as usize
    }

    /// Exact length of a valid file with this header.
    pub fn file_len(&self) -> usize {
        HEADER_LEN + self.pixel_len()
    }

    /// Pixels per logical unit when presented at the original size.
    pub fn display_scale(&self) -> f64 {
        let sy = self.height as f64 / self.full_height as f64;
        let sx = self.width as f64 / self.full_width as f64;
        sy.min(sx)
    }
}

/// Stored size for a `width` x `height` source so that the pixel count is
/// close to, and never above, `budget`. Never upscales.
/// Sides past `u16::MAX` are left for the header check to reject.
pub fn preview_dimensions(width: u32, height: u32, budget: u32) -> (u32, u32) {
    let area = width as f64 * height as f64;
    let scale = (budget as f64 / area).sqrt().min(1.0);
    // Epsilon keeps exact products (e.g. 100 * 0.5) from flooring down.
    let mut w = (width as f64 * scale + 1e-9).floor() as u32;
    let mut h = (height as f64 * scale + 1e-9).floor() as u32;
    // A side that collapsed to zero keeps one pixel and hands the rest of
    // the budget to the other side.
    if w == 0 {
        w = 1;
        h = height.min(budget);
    }
    if h == 0 {
        h = 1;
        w = width.min(budget);
    }
    (w, h)
}

fn to_u16(value: u32) -> PreviewResult<u16> {
    u16::try_from(value).map_err(|_| PreviewError::DimensionOverflow(value))
}

/// Shifts a provider's bytes past the header so the image sees only pixels.
struct PixelsAfterHeader(Arc<dyn PixelProvider>);

impl PixelProvider for PixelsAfterHeader {
    fn bytes(&self) -> &[u8] {
        &self.0.bytes()[HEADER_LEN..]
    }
}

pub struct PreviewCodec {
    rasterizer: Arc<dyn Rasterizer>,
    pixel_budget: u32,
}

impl PreviewCodec {
    pub fn new(rasterizer: Arc<dyn Rasterizer>, pixel_budget: u32) -> Self {
        let pixel_budget = if pixel_budget == 0 {
            DEFAULT_PREVIEW_PIXEL_BUDGET
        } else {
            pixel_budget
        };
        Self {
            rasterizer,
            pixel_budget,
        }
    }

    pub fn pixel_budget(&self) -> u32 {
        self.pixel_budget
    }

    /// Downsample `image` to the pixel budget and serialize header + pixels.
    pub fn encode(&self, image: &DynamicImage, orientation: Orientation) -> PreviewResult<Vec<u8>> {
        let (full_width, full_height) = (image.width(), image.height());
        // A zero-sized source would write a header that never decodes.
        BitmapInfo::new(full_width, full_height, ColorLayout::Rgb555)?;
        let (width, height) = preview_dimensions(full_width, full_height, self.pixel_budget);

        let header = PreviewHeader {
            full_width: to_u16(full_width)?,
            full_height: to_u16(full_height)?,
            width: to_u16(width)?,
            height: to_u16(height)?,
            orientation,
        };
        let info = BitmapInfo::new(width, height, ColorLayout::Rgb555)?;

        let mut out = vec![0u8; header.file_len()];
        out[..HEADER_LEN].copy_from_slice(&header.to_bytes());
        self.rasterizer.draw(image, &info, &mut out[HEADER_LEN..])?;

        debug!(
            "encoded {}x{} preview of {}x{} image",
            width, height, full_width, full_height
        );
        Ok(out)
    }

    /// Validate and view `bytes` as a preview image without copying pixels.
    /// Any violation is a miss.
    pub fn decode(&self, bytes: Arc<dyn PixelProvider>) -> Option<(Image, PreviewHeader)> {
        match self.try_decode(bytes) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                debug!("rejected preview: {}", e);
                None
            }
        }
    }

    pub fn try_decode(
        &self,
        bytes: Arc<dyn PixelProvider>,
    ) -> PreviewResult<(Image, PreviewHeader)> {
        let data = bytes.bytes();
        let header = PreviewHeader::parse(data)?;
        if data.len() != header.file_len() {
            return Err(PreviewError::LengthMismatch {
                expected: header.file_len(),
                actual: data.len(),
            });
        }
        // Zero full dimensions would make the scale meaningless.
        BitmapInfo::new(header.full_width as u32, header.full_height as u32, ColorLayout::Rgb555)?;
        let info = BitmapInfo::new(header.width as u32, header.height as u32, ColorLayout::Rgb555)?;

        let image = self.rasterizer.wrap(
            Arc::new(PixelsAfterHeader(bytes)),
            info,
            header.orientation,
            header.display_scale(),
        )?;
        Ok((image, header))
    }
}
