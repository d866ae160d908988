//! Reclaimable pixel buffers
//!
//! A `PurgeableBuffer` is either live or discarded. The host memory system
//! may discard it at any time nobody holds an access; once discarded it never
//! comes back, and every later `begin_access` fails. Readers bracket their use
//! with begin/end access, usually through an `AccessGuard`.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::bitmap::info::{BitmapInfo, TargetSize};
use crate::error::{RasterError, RasterResult};
use crate::raster::{Image, Orientation, PixelProvider, Rasterizer, SourceImage};

#[derive(Debug)]
struct BufferState {
    data: Option<Arc<Vec<u8>>>,
    accessors: usize,
}

#[derive(Debug)]
pub struct PurgeableBuffer {
    state: Mutex<BufferState>,
    len: usize,
}

impl PurgeableBuffer {
    /// Wrap `data` with one access already begun. The creator must balance
    /// it with exactly one `end_access`.
    pub fn new_accessed(data: Vec<u8>) -> Arc<Self> {
        let len = data.len();
        Arc::new(Self {
            state: Mutex::new(BufferState {
                data: Some(Arc::new(data)),
                accessors: 1,
            }),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns false if the contents were discarded.
    pub fn begin_access(&self) -> bool {
        let mut state = self.state.lock();
        if state.data.is_none() {
            return false;
        }
        state.accessors += 1;
        true
    }

    pub fn end_access(&self) {
        let mut state = self.state.lock();
        state.accessors = state.accessors.saturating_sub(1);
    }

    /// Drop the contents if nobody is accessing them.
    pub fn discard(&self) -> bool {
        let mut state = self.state.lock();
        if state.accessors > 0 || state.data.is_none() {
            return false;
        }
        state.data = None;
        debug!("discarded {} byte pixel buffer", self.len);
        true
    }

    pub fn is_discarded(&self) -> bool {
        self.state.lock().data.is_none()
    }

    /// Begin an access that ends when the returned guard drops.
    pub fn try_access(self: &Arc<Self>) -> Option<AccessGuard> {
        let mut state = self.state.lock();
        let data = state.data.clone()?;
        state.accessors += 1;
        Some(AccessGuard {
            buffer: Arc::clone(self),
            data,
        })
    }
}

/// Holds one access on a `PurgeableBuffer` and exposes its bytes.
/// This is the pixel provider behind images built from cached bitmaps.
#[derive(Debug)]
pub struct AccessGuard {
    buffer: Arc<PurgeableBuffer>,
    data: Arc<Vec<u8>>,
}

impl PixelProvider for AccessGuard {
    fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        self.buffer.end_access();
    }
}

/// A decoded bitmap whose pixel memory may be reclaimed between accesses.
/// Write-once: contents never change after `create`.
#[derive(Debug)]
pub struct PurgeableBitmap {
    buffer: Arc<PurgeableBuffer>,
    info: BitmapInfo,
    orientation: Orientation,
}

impl PurgeableBitmap {
    /// Draw `source` at `target` into a fresh buffer. `None` on any failure.
    ///
    /// The returned bitmap starts with one access held; release it with
    /// `end_access` once the first image has been produced.
    pub fn create(
        source: &SourceImage,
        target: TargetSize,
        rasterizer: &dyn Rasterizer,
    ) -> Option<Self> {
        match Self::try_create(source, target, rasterizer) {
            Ok(bitmap) => Some(bitmap),
            Err(e) => {
                debug!("bitmap creation failed: {}", e);
                None
            }
        }
    }

    pub fn try_create(
        source: &SourceImage,
        target: TargetSize,
        rasterizer: &dyn Rasterizer,
    ) -> RasterResult<Self> {
        let info = BitmapInfo::for_image(&source.pixels, target)?;
        let len = info.buffer_length();

        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| RasterError::Allocation(len))?;
        data.resize(len, 0);

        rasterizer.draw(&source.pixels, &info, &mut data)?;

        Ok(Self {
            buffer: PurgeableBuffer::new_accessed(data),
            info,
            orientation: source.orientation,
        })
    }

    /// Build a displayable image over the buffer without copying.
    ///
    /// `None` means the buffer was discarded; treat it as a cache miss.
    /// The access begun here ends when the image's provider is dropped.
    pub fn to_image(&self, rasterizer: &dyn Rasterizer) -> Option<Image> {
        let guard = self.buffer.try_access()?;
        rasterizer
            .wrap(Arc::new(guard), self.info, self.orientation, 1.0)
            .ok()
    }

    pub fn end_access(&self) {
        self.buffer.end_access();
    }

    pub fn info(&self) -> &BitmapInfo {
        &self.info
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn buffer(&self) -> &Arc<PurgeableBuffer> {
        &self.buffer
    }
}
