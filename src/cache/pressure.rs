//! Memory-pressure notifications
//!
//! A `PressureSource` stands in for the host's low-memory / backgrounding
//! notifications. Caches subscribe at construction and hold the returned
//! `Subscription`; dropping it unsubscribes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

/// Why the host wants memory back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureEvent {
    MemoryWarning,
    EnteredBackground,
}

type Handler = Arc<dyn Fn(PressureEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<u64, Handler>>,
}

/// Broadcasts pressure events to every live subscriber. Clones share
/// the same subscriber list.
#[derive(Clone, Default)]
pub struct PressureSource {
    registry: Arc<Registry>,
}

impl PressureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(PressureEvent) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.handlers.lock().insert(id, Arc::new(handler));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }

    /// Deliver `event` to all subscribers on the calling thread.
    pub fn signal(&self, event: PressureEvent) {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler> = self.registry.handlers.lock().values().cloned().collect();
        debug!("memory pressure {:?} -> {} subscribers", event, handlers.len());
        for handler in handlers {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.handlers.lock().len()
    }
}

/// Unsubscribes on drop.
pub struct Subscription {
    registry: Weak<Registry>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.handlers.lock().remove(&self.id);
        }
    }
}
