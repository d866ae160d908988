//! Decoded-bitmap cache with coalesced decode requests
//!
//! Per key: Absent -> Pending -> Cached -> Absent (discarded buffer or
//! pressure purge). The first request for an uncached key starts one decode
//! job; every request that arrives before the job's result is delivered
//! waits on that same job and receives the same image.
//!
//! Threads:
//! - callers register and return immediately (or get a cached hit inline)
//! - decode jobs run on a small blocking pool (`max_concurrent_decodes`)
//!   whose threads drop to the lowest OS scheduling priority
//! - completions are drained and invoked by one delivery task, so waiters
//!   for a key always fire in registration order

use std::cell::Cell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use thread_priority::{set_current_thread_priority, ThreadPriority};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;

use crate::bitmap::{PurgeableBitmap, TargetSize};
use crate::cache::pressure::{PressureSource, Subscription};
use crate::config::CacheConfig;
use crate::raster::{Image, Rasterizer};

/// Completion for a decode request. Receives `None` when the original could
/// not be loaded or decoded.
pub type DecodeCallback = Box<dyn FnOnce(Option<Image>) + Send + 'static>;

type Loader = Box<dyn FnOnce() -> Option<Vec<u8>> + Send + 'static>;

struct Pending {
    /// Fixed by the first request; later requests share it.
    target: TargetSize,
    waiters: Vec<DecodeCallback>,
}

#[derive(Default)]
struct CacheState {
    bitmaps: HashMap<String, Arc<PurgeableBitmap>>,
    pending: HashMap<String, Pending>,
    /// Bumped on every purge. Jobs started under an older generation
    /// deliver their result but do not store it.
    generation: u64,
}

thread_local! {
    /// Set once a pool thread has tried to lower its priority.
    static UTILITY_PRIORITY: Cell<bool> = const { Cell::new(false) };
}

/// Drop the calling pool thread to utility priority. Runs once per thread;
/// the delivery worker never calls it.
fn enter_utility_priority() {
    UTILITY_PRIORITY.with(|entered| {
        if entered.replace(true) {
            return;
        }
        if let Err(e) = set_current_thread_priority(ThreadPriority::Min) {
            debug!("could not lower decode thread priority: {:?}", e);
        }
    });
}

struct Delivery {
    key: String,
    image: Option<Image>,
}

struct Shared {
    state: Mutex<CacheState>,
    rasterizer: Arc<dyn Rasterizer>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Shared {
    fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.bitmaps.len();
        state.bitmaps.clear();
        state.generation += 1;
        debug!("decompression cache cleared ({} bitmaps)", dropped);
    }
}

pub struct DecompressionCache {
    shared: Arc<Shared>,
    handle: Handle,
    runtime: Option<Runtime>,
    _pressure: Subscription,
}

impl DecompressionCache {
    /// Build a cache that clears itself on every `pressure` event.
    pub fn new(
        rasterizer: Arc<dyn Rasterizer>,
        pressure: &PressureSource,
        config: &CacheConfig,
    ) -> io::Result<Self> {
        let config = config.clone().validated();

        // One async worker hosts the delivery task; decode jobs go to the
        // blocking pool, which never grows past the configured bound.
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.max_concurrent_decodes)
            .thread_name("decode-worker")
            .build()?;
        let handle = runtime.handle().clone();

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState::default()),
            rasterizer,
            deliveries: tx,
        });
        handle.spawn(deliver(Arc::clone(&shared), rx));

        let weak = Arc::downgrade(&shared);
        let subscription = pressure.subscribe(move |event| {
            if let Some(shared) = weak.upgrade() {
                debug!("purging decoded bitmaps on {:?}", event);
                shared.clear();
            }
        });

        debug!(
            "decompression cache ready ({} concurrent decodes)",
            config.max_concurrent_decodes
        );

        Ok(Self {
            shared,
            handle,
            runtime: Some(runtime),
            _pressure: subscription,
        })
    }

    /// Request the decoded image for `key`.
    ///
    /// A cached, still-resident bitmap is returned immediately and
    /// `on_decoded` is never called. Otherwise this returns `None` and
    /// `on_decoded` fires later, once, from the delivery task.
    ///
    /// Requests are coalesced by exact key. The first request for an
    /// uncached key decides the target size for everyone waiting on it.
    pub fn request<L, F>(
        &self,
        key: &str,
        target: TargetSize,
        load_original: L,
        on_decoded: F,
    ) -> Option<Image>
    where
        L: FnOnce() -> Option<Vec<u8>> + Send + 'static,
        F: FnOnce(Option<Image>) + Send + 'static,
    {
        let mut state = self.shared.state.lock();

        if let Some(bitmap) = state.bitmaps.get(key) {
            if let Some(image) = bitmap.to_image(&*self.shared.rasterizer) {
                debug!("cache hit for {}", key);
                return Some(image);
            }
            debug!("bitmap for {} was reclaimed, decoding again", key);
            state.bitmaps.remove(key);
        }

        match state.pending.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                if pending.target != target {
                    debug!(
                        "{} already decoding at {:?}, ignoring {:?}",
                        key, pending.target, target
                    );
                }
                pending.waiters.push(Box::new(on_decoded));
                return None;
            }
            Entry::Vacant(entry) => {
                entry.insert(Pending {
                    target,
                    waiters: vec![Box::new(on_decoded)],
                });
            }
        }
        let generation = state.generation;
        drop(state);

        self.spawn_job(key.to_owned(), target, generation, Box::new(load_original));
        None
    }

    fn spawn_job(&self, key: String, target: TargetSize, generation: u64, load: Loader) {
        let shared = Arc::clone(&self.shared);
        debug!("decode job queued for {}", key);
        self.handle.spawn_blocking(move || {
            enter_utility_priority();
            let image = panic::catch_unwind(AssertUnwindSafe(|| {
                decode_and_store(&shared, &key, target, generation, load)
            }))
            .unwrap_or_else(|_| {
                warn!("decode job for {} panicked", key);
                None
            });

            if shared.deliveries.send(Delivery { key, image }).is_err() {
                debug!("cache torn down before delivery");
            }
        });
    }

    /// Drop every cached bitmap. In-flight jobs still deliver.
    pub fn clear(&self) {
        self.shared.clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shared.state.lock().bitmaps.contains_key(key)
    }

    pub fn cached_count(&self) -> usize {
        self.shared.state.lock().bitmaps.len()
    }

    /// Number of keys with a decode in flight or awaiting delivery.
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().pending.len()
    }
}

impl Drop for DecompressionCache {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn decode_and_store(
    shared: &Shared,
    key: &str,
    target: TargetSize,
    generation: u64,
    load: Loader,
) -> Option<Image> {
    let rasterizer = &*shared.rasterizer;

    let Some(compressed) = load() else {
        debug!("original for {} unavailable", key);
        return None;
    };
    let source = match rasterizer.decode(&compressed) {
        Ok(source) => source,
        Err(e) => {
            debug!("decode failed for {}: {}", key, e);
            return None;
        }
    };
    let bitmap = Arc::new(PurgeableBitmap::create(&source, target, rasterizer)?);

    {
        let mut state = shared.state.lock();
        if state.generation == generation {
            state.bitmaps.insert(key.to_owned(), Arc::clone(&bitmap));
        } else {
            debug!("cache purged while decoding {}, not retaining", key);
        }
    }

    let image = bitmap.to_image(rasterizer);
    bitmap.end_access();
    debug!(
        "decoded {} at {}x{}",
        key,
        bitmap.info().width,
        bitmap.info().height
    );
    image
}

async fn deliver(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(Delivery { key, image }) = rx.recv().await {
        let waiters = shared
            .state
            .lock()
            .pending
            .remove(&key)
            .map(|pending| pending.waiters)
            .unwrap_or_default();

        // The last waiter takes the original so no access outlives delivery.
        let mut image = image;
        let mut waiters = waiters.into_iter().peekable();
        while let Some(waiter) = waiters.next() {
            let image = if waiters.peek().is_some() {
                image.clone()
            } else {
                image.take()
            };
            if panic::catch_unwind(AssertUnwindSafe(|| waiter(image))).is_err() {
                warn!("completion for {} panicked", key);
            }
        }
    }
}
