//! In-memory decoded-image caching
//!
//! - `decompression.rs`: key -> bitmap cache with coalesced decode jobs
//! - `pressure.rs`: memory-pressure events that purge caches

pub mod decompression;
pub mod pressure;

pub use decompression::{DecodeCallback, DecompressionCache};
pub use pressure::{PressureEvent, PressureSource, Subscription};
