//! Decode images once, keep the bitmaps, and persist tiny previews.
//!
//! Two halves:
//! - `cache`: an in-memory decoded-bitmap cache. Concurrent requests for the
//!   same key share one decode job on a small worker pool; bitmaps live in
//!   reclaimable buffers and the whole cache drops on memory pressure.
//! - `preview`: a compact fixed-header RGB555 file format for ~2500-pixel
//!   previews, written through temp-file-then-rename and read back through
//!   memory maps.
//!
//! Pixel work sits behind the `Rasterizer` trait; `ImageRasterizer` is the
//! default, built on the `image` crate.

pub mod bitmap;
pub mod cache;
pub mod config;
pub mod error;
pub mod preview;
pub mod raster;

pub use bitmap::{BitmapInfo, ColorLayout, PurgeableBitmap, PurgeableBuffer, TargetSize};
pub use cache::{DecompressionCache, PressureEvent, PressureSource};
pub use config::{CacheConfig, ResizeFilter};
pub use error::{PreviewError, RasterError};
pub use preview::{AtomicFileWriter, PreviewCodec, PreviewHeader, PreviewStore, TransactionalWriter};
pub use raster::{Image, ImageRasterizer, Orientation, PixelProvider, Rasterizer, SourceImage};

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    #[test]
    fn test_decode_then_preview_then_purge() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            preview_dir: Some(dir.path().to_path_buf()),
            ..CacheConfig::default()
        };
        let pressure = PressureSource::new();
        let rasterizer: Arc<dyn Rasterizer> = Arc::new(config.rasterizer());
        let cache = DecompressionCache::new(Arc::clone(&rasterizer), &pressure, &config).unwrap();
        let store = PreviewStore::from_config(&config, rasterizer, &pressure).unwrap();

        let source = DynamicImage::ImageRgb8(RgbImage::from_pixel(2000, 1000, Rgb([40, 80, 160])));
        let mut png = Cursor::new(Vec::new());
        source.write_to(&mut png, ImageFormat::Png).unwrap();
        let png = png.into_inner();

        let (tx, rx) = mpsc::channel();
        let hit = cache.request(
            "IMG_0001",
            TargetSize::WidthScaledTo(100),
            move || Some(png),
            move |image| tx.send(image).unwrap(),
        );
        assert!(hit.is_none());
        let decoded = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 50));

        let pixels = DynamicImage::ImageRgba8(decoded.to_rgba());
        assert!(store.set_image(&pixels, decoded.orientation(), "IMG_0001"));
        let preview = store.image_with_name("IMG_0001").unwrap();
        assert_eq!((preview.width(), preview.height()), (70, 35));

        assert_eq!(cache.cached_count(), 1);
        assert_eq!(store.cached_count(), 1);
        pressure.signal(PressureEvent::MemoryWarning);
        assert_eq!(cache.cached_count(), 0);
        assert_eq!(store.cached_count(), 0);

        // Files survive the purge.
        assert!(store.image_with_name("IMG_0001").is_some());
    }
}
