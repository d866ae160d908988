//! Raw bitmap handling
//!
//! This module handles:
//! - Bitmap geometry and pixel layouts (info.rs)
//! - Reclaimable pixel buffers and the bitmaps built on them (purgeable.rs)

pub mod info;
pub mod purgeable;

pub use info::{BitmapInfo, ColorLayout, TargetSize};
pub use purgeable::{AccessGuard, PurgeableBitmap, PurgeableBuffer};
