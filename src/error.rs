//! Error types for the raster and preview layers.
//!
//! These never cross the public cache/store surface as-is: the cache folds
//! every failure into a `None` result and the store into `false`/`None`.
//! They exist so the internals can use `?` and so logs carry a cause.

use thiserror::Error;

/// Failures from decoding or drawing pixels.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("failed to read image bytes: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid bitmap dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("destination buffer is {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("could not allocate {0} bytes for pixel buffer")]
    Allocation(usize),
}

/// Failures from encoding, persisting or reading previews.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("preview I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error("dimension {0} does not fit in a 16-bit header field")]
    DimensionOverflow(u32),

    #[error("bad preview magic {0:#06x}")]
    BadMagic(u16),

    #[error("preview is {actual} bytes, header implies {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("unknown orientation value {0}")]
    BadOrientation(u16),

    #[error("preview too short for header ({0} bytes)")]
    Truncated(usize),
}

pub type RasterResult<T> = Result<T, RasterError>;
pub type PreviewResult<T> = Result<T, PreviewError>;
