//! Named preview persistence
//!
//! Previews live one file per name under a base directory. Reads go through
//! an in-memory name -> image map (emptied on memory pressure), then a
//! memory-mapped file validated by the codec. Missing, truncated or corrupt
//! files are all just misses.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::DynamicImage;
use log::{debug, warn};
use memmap2::Mmap;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use crate::cache::pressure::{PressureSource, Subscription};
use crate::config::CacheConfig;
use crate::error::PreviewResult;
use crate::preview::codec::{PreviewCodec, HEADER_LEN};
use crate::preview::writer::{AtomicFileWriter, TransactionalWriter};
use crate::raster::{Image, Orientation, PixelProvider, Rasterizer, SourceImage};

struct MappedPreview(Mmap);

impl PixelProvider for MappedPreview {
    fn bytes(&self) -> &[u8] {
        &self.0
    }
}

pub struct PreviewStore {
    dir: PathBuf,
    codec: PreviewCodec,
    writer: Arc<dyn TransactionalWriter>,
    images: Arc<Mutex<HashMap<String, Image>>>,
    _pressure: Subscription,
}

impl PreviewStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        codec: PreviewCodec,
        writer: Arc<dyn TransactionalWriter>,
        pressure: &PressureSource,
    ) -> Self {
        let images: Arc<Mutex<HashMap<String, Image>>> = Arc::default();
        let weak = Arc::downgrade(&images);
        let subscription = pressure.subscribe(move |event| {
            if let Some(images) = weak.upgrade() {
                let mut images = images.lock();
                debug!("dropping {} cached previews on {:?}", images.len(), event);
                images.clear();
            }
        });

        Self {
            dir: dir.into(),
            codec,
            writer,
            images,
            _pressure: subscription,
        }
    }

    /// Store in the configured preview directory with atomic file writes.
    /// `None` when no directory is configured and no user cache dir exists.
    pub fn from_config(
        config: &CacheConfig,
        rasterizer: Arc<dyn Rasterizer>,
        pressure: &PressureSource,
    ) -> Option<Self> {
        let dir = config.preview_dir()?;
        let codec = PreviewCodec::new(rasterizer, config.preview_pixel_budget);
        Some(Self::new(dir, codec, Arc::new(AtomicFileWriter::new()), pressure))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for `name`: the percent-encoded name under the base
    /// directory. Names that encode identically share a file.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(utf8_percent_encode(name, NON_ALPHANUMERIC).to_string())
    }

    /// Encode and persist a preview of `image`. `false` on any failure, in
    /// which case an existing file for `name` is left as it was.
    pub fn set_image(&self, image: &DynamicImage, orientation: Orientation, name: &str) -> bool {
        match self.try_set_image(image, orientation, name) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to store preview {:?}: {}", name, e);
                false
            }
        }
    }

    pub fn set_source(&self, source: &SourceImage, name: &str) -> bool {
        self.set_image(&source.pixels, source.orientation, name)
    }

    pub fn try_set_image(
        &self,
        image: &DynamicImage,
        orientation: Orientation,
        name: &str,
    ) -> PreviewResult<()> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty preview name").into());
        }
        let bytes = self.codec.encode(image, orientation)?;
        self.writer.write(&self.path_for(name), &bytes)?;
        // Whatever was cached for this name is now stale.
        self.images.lock().remove(name);
        debug!("stored preview {:?} ({} bytes)", name, bytes.len());
        Ok(())
    }

    /// Cached or on-disk preview for `name`, presented at the original
    /// image's size. `None` for anything missing or invalid.
    pub fn image_with_name(&self, name: &str) -> Option<Image> {
        if name.is_empty() {
            return None;
        }
        if let Some(image) = self.images.lock().get(name) {
            return Some(image.clone());
        }

        let image = self.read(name)?;
        self.images.lock().insert(name.to_owned(), image.clone());
        Some(image)
    }

    fn read(&self, name: &str) -> Option<Image> {
        let path = self.path_for(name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!("cannot open preview {}: {}", path.display(), e);
                }
                return None;
            }
        };
        if file.metadata().ok()?.len() < HEADER_LEN as u64 {
            debug!("preview {} too short", path.display());
            return None;
        }

        // SAFETY: preview files are only ever replaced by rename, never
        // rewritten in place, so the mapped inode's bytes do not change
        // under us.
        let map = match unsafe { Mmap::map(&file) } {
            Ok(map) => map,
            Err(e) => {
                debug!("cannot map preview {}: {}", path.display(), e);
                return None;
            }
        };

        match self.codec.decode(Arc::new(MappedPreview(map))) {
            Some((image, _header)) => Some(image),
            None => {
                warn!("ignoring corrupt preview {}", path.display());
                None
            }
        }
    }

    /// Delete the preview for `name` from disk and memory.
    pub fn remove(&self, name: &str) -> bool {
        self.images.lock().remove(name);
        if name.is_empty() {
            return false;
        }
        fs::remove_file(self.path_for(name)).is_ok()
    }

    /// Drop all in-memory previews (files stay).
    pub fn clear_memory(&self) {
        self.images.lock().clear();
    }

    pub fn cached_count(&self) -> usize {
        self.images.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::pressure::PressureEvent;
    use crate::preview::codec::PreviewHeader;
    use crate::raster::ImageRasterizer;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    struct FailingWriter;

    impl TransactionalWriter for FailingWriter {
        fn write(&self, _destination: &Path, _bytes: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    fn store_in(dir: &TempDir, pressure: &PressureSource) -> PreviewStore {
        store_with_writer(dir, pressure, Arc::new(AtomicFileWriter::new()))
    }

    fn store_with_writer(
        dir: &TempDir,
        pressure: &PressureSource,
        writer: Arc<dyn TransactionalWriter>,
    ) -> PreviewStore {
        let codec = PreviewCodec::new(Arc::new(ImageRasterizer::default()), 2500);
        PreviewStore::new(dir.path().join("previews"), codec, writer, pressure)
    }

    fn gradient(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 64])
        }))
    }

    #[test]
    fn test_set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let store = store_in(&dir, &pressure);

        assert!(store.set_image(&gradient(2462, 3264), Orientation::Up, "foo"));
        let image = store.image_with_name("foo").unwrap();

        assert_eq!((image.width(), image.height()), (43, 57));
        let (w, h) = image.size();
        assert!((w - 2462.0).abs() < 0.5);
        assert!((h - 3264.0).abs() < 0.5);
        assert!(43.0 / 57.0 <= 2462.0 / 3264.0 + 0.01);

        let len = fs::metadata(store.path_for("foo")).unwrap().len();
        assert_eq!(len as usize, 12 + 2 * 43 * 57);
    }

    #[test]
    fn test_missing_name_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let store = store_in(&dir, &pressure);
        assert!(store.image_with_name("nothing").is_none());
        assert!(store.image_with_name("").is_none());
        assert_eq!(store.cached_count(), 0);
    }

    #[test]
    fn test_corrupt_files_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let store = store_in(&dir, &pressure);
        assert!(store.set_image(&gradient(100, 100), Orientation::Up, "good"));
        let original = fs::read(store.path_for("good")).unwrap();

        let mut long = original.clone();
        long.push(0);
        fs::write(store.path_for("long"), &long).unwrap();
        fs::write(store.path_for("short"), &original[..original.len() - 1]).unwrap();
        let mut magic = original.clone();
        magic[1] = 0xED;
        fs::write(store.path_for("magic"), &magic).unwrap();
        fs::write(store.path_for("tiny"), b"\x5A\xEC").unwrap();
        fs::write(store.path_for("empty"), b"").unwrap();

        for name in ["long", "short", "magic", "tiny", "empty"] {
            assert!(store.image_with_name(name).is_none(), "{}", name);
        }
        assert!(store.image_with_name("good").is_some());
        assert_eq!(store.cached_count(), 1);
    }

    #[test]
    fn test_memory_cache_serves_repeat_reads() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let store = store_in(&dir, &pressure);
        assert!(store.set_image(&gradient(50, 50), Orientation::Left, "p"));

        let first = store.image_with_name("p").unwrap();
        let second = store.image_with_name("p").unwrap();
        assert!(first.same_pixels(&second));
        assert_eq!(second.orientation(), Orientation::Left);
    }

    #[test]
    fn test_pressure_empties_memory_cache() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let store = store_in(&dir, &pressure);
        assert!(store.set_image(&gradient(50, 50), Orientation::Up, "p"));
        assert!(store.image_with_name("p").is_some());
        assert_eq!(store.cached_count(), 1);

        // With the file gone, only the memory cache could answer.
        fs::remove_file(store.path_for("p")).unwrap();
        assert!(store.image_with_name("p").is_some());

        pressure.signal(PressureEvent::MemoryWarning);
        assert_eq!(store.cached_count(), 0);
        assert!(store.image_with_name("p").is_none());
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let good = store_in(&dir, &pressure);
        assert!(good.set_image(&gradient(80, 40), Orientation::Up, "keep"));
        let before = fs::read(good.path_for("keep")).unwrap();

        let failing = store_with_writer(&dir, &pressure, Arc::new(FailingWriter));
        assert!(!failing.set_image(&gradient(300, 300), Orientation::Down, "keep"));
        assert_eq!(fs::read(failing.path_for("keep")).unwrap(), before);
    }

    #[test]
    fn test_zero_sized_source_is_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let store = store_in(&dir, &pressure);

        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 5));
        assert!(!store.set_image(&empty, Orientation::Up, "z"));
        assert!(!store.path_for("z").exists());
        assert!(store.image_with_name("z").is_none());
    }

    #[test]
    fn test_rewrite_replaces_cached_entry() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let store = store_in(&dir, &pressure);
        assert!(store.set_image(&gradient(100, 100), Orientation::Up, "n"));
        assert_eq!(store.image_with_name("n").unwrap().width(), 50);

        assert!(store.set_image(&gradient(200, 50), Orientation::Up, "n"));
        let image = store.image_with_name("n").unwrap();
        assert_eq!((image.width(), image.height()), (100, 25));
    }

    #[test]
    fn test_names_are_percent_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let store = store_in(&dir, &pressure);

        let path = store.path_for("albums/2024 trip.jpg");
        assert_eq!(path.file_name().unwrap(), "albums%2F2024%20trip%2Ejpg");
        assert_eq!(path.parent().unwrap(), store.dir());

        assert!(store.set_image(&gradient(30, 30), Orientation::Up, "../escape"));
        assert!(store.dir().join("%2E%2E%2Fescape").exists());
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let store = store_in(&dir, &pressure);
        assert!(store.set_image(&gradient(30, 30), Orientation::Up, "gone"));
        assert!(store.image_with_name("gone").is_some());

        assert!(store.remove("gone"));
        assert!(store.image_with_name("gone").is_none());
        assert!(!store.remove("gone"));
    }

    #[test]
    fn test_file_header_matches_source() {
        let dir = tempfile::tempdir().unwrap();
        let pressure = PressureSource::new();
        let store = store_in(&dir, &pressure);
        let source = SourceImage::new(gradient(640, 480), Orientation::RightMirrored);
        assert!(store.set_source(&source, "h"));

        let bytes = fs::read(store.path_for("h")).unwrap();
        let header = PreviewHeader::parse(&bytes).unwrap();
        assert_eq!((header.full_width, header.full_height), (640, 480));
        assert_eq!(header.orientation, Orientation::RightMirrored);
        assert_eq!(bytes.len(), header.file_len());
    }
}
