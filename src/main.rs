use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use clap::{Parser, Subcommand};
use image::DynamicImage;
use walkdir::WalkDir;

use preview_cache::{
    CacheConfig, DecompressionCache, Image, PressureSource, PreviewStore, TargetSize,
};

/// Supported source extensions (anything the rasterizer decodes)
const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "tiff"];

/// How long to wait for one decode before giving up on the import
const DECODE_TIMEOUT: Duration = Duration::from_secs(120);

/// Decoded bitmaps are only needed until their preview is stored, so the
/// cache is emptied after this many deliveries.
const CLEAR_EVERY: usize = 32;

/// Decode images once and keep tiny previews on disk
#[derive(Parser)]
#[command(name = "preview-cache", version, about)]
struct CliArgs {
    /// JSON cache configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Preview directory (overrides the config)
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode every image under a folder and store a preview for each
    Import {
        folder: PathBuf,

        /// Decode width (full size when omitted)
        #[arg(long)]
        width: Option<u32>,
    },

    /// Print what the store holds for a name
    Inspect { name: String },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CliArgs::parse();
    let config = match load_config(args.config.as_deref(), args.out) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };

    let pressure = PressureSource::new();
    let rasterizer = Arc::new(config.rasterizer());
    let Some(store) = PreviewStore::from_config(&config, rasterizer.clone(), &pressure) else {
        eprintln!("❌ Could not determine a preview directory; pass --out");
        return ExitCode::FAILURE;
    };

    match args.command {
        Command::Import { folder, width } => {
            let cache = match DecompressionCache::new(rasterizer, &pressure, &config) {
                Ok(cache) => cache,
                Err(e) => {
                    eprintln!("❌ Failed to start decode workers: {}", e);
                    return ExitCode::FAILURE;
                }
            };
            let target = width.map_or(TargetSize::Full, TargetSize::WidthScaledTo);
            let result = import_folder(&folder, target, &cache, &store, CLEAR_EVERY);
            println!(
                "✅ Import complete: {} previews stored, {} failed",
                result.stored, result.failed
            );
            if result.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Command::Inspect { name } => match store.image_with_name(&name) {
            Some(image) => {
                let (w, h) = image.size();
                println!(
                    "📸 {}: {}x{} stored, presents at {:.0}x{:.0}, {:?}",
                    name,
                    image.width(),
                    image.height(),
                    w,
                    h,
                    image.orientation()
                );
                ExitCode::SUCCESS
            }
            None => {
                eprintln!("❌ No valid preview for {:?} in {}", name, store.dir().display());
                ExitCode::FAILURE
            }
        },
    }
}

fn load_config(path: Option<&Path>, out: Option<PathBuf>) -> Result<CacheConfig, String> {
    let mut config = match path {
        Some(path) => {
            let json = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
            CacheConfig::from_json(&json)
                .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?
        }
        None => CacheConfig::default(),
    };
    if out.is_some() {
        config.preview_dir = out;
    }
    Ok(config)
}

/// Result of a folder import
#[derive(Debug, Default)]
struct ImportResult {
    stored: usize,
    failed: usize,
}

/// Queue a decode for every image under `folder`, then store a preview for
/// each decoded result as it arrives. The cache is cleared every
/// `clear_every` deliveries.
fn import_folder(
    folder: &Path,
    target: TargetSize,
    cache: &DecompressionCache,
    store: &PreviewStore,
    clear_every: usize,
) -> ImportResult {
    let mut result = ImportResult::default();
    let (tx, rx) = mpsc::channel::<(String, Option<Image>)>();
    let mut queued = 0usize;

    println!("🔍 Scanning folder: {}", folder.display());

    for entry in WalkDir::new(folder)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() || !has_image_extension(path) {
            continue;
        }

        let key = path.to_string_lossy().into_owned();
        let source = path.to_path_buf();
        let tx = tx.clone();
        let reply_key = key.clone();
        let hit = cache.request(
            &key,
            target,
            move || fs::read(source).ok(),
            move |image| {
                let _ = tx.send((reply_key, image));
            },
        );
        match hit {
            Some(image) => store_preview(store, &key, Some(image), &mut result),
            None => queued += 1,
        }
    }
    drop(tx);

    for received in 1..=queued {
        match rx.recv_timeout(DECODE_TIMEOUT) {
            Ok((key, image)) => {
                store_preview(store, &key, image, &mut result);
                if clear_every > 0 && received % clear_every == 0 {
                    cache.clear();
                }
            }
            Err(_) => {
                eprintln!("⚠️  Timed out waiting for decodes");
                break;
            }
        }
    }

    result
}

fn store_preview(store: &PreviewStore, key: &str, image: Option<Image>, result: &mut ImportResult) {
    let Some(image) = image else {
        eprintln!("⚠️  Could not decode {}", key);
        result.failed += 1;
        return;
    };

    let pixels = DynamicImage::ImageRgba8(image.to_rgba());
    if store.set_image(&pixels, image.orientation(), key) {
        result.stored += 1;
        if result.stored % 100 == 0 {
            println!("⏳ Stored {} previews...", result.stored);
        }
    } else {
        result.failed += 1;
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}
