//! Cache configuration
//!
//! Serialized to JSON so a host app can persist it next to its other
//! settings. Every field has a default; a partial JSON object is fine.

use std::path::PathBuf;

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::raster::ImageRasterizer;

/// Default worker pool bound for decode jobs.
pub const DEFAULT_MAX_CONCURRENT_DECODES: usize = 3;

/// Default `width * height` target for stored previews.
pub const DEFAULT_PREVIEW_PIXEL_BUDGET: u32 = 2500;

/// Resampling filter used when drawing at a smaller size.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResizeFilter {
    Nearest,
    #[default]
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Gaussian => FilterType::Gaussian,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Decode jobs allowed to run at once (0 means default)
    pub max_concurrent_decodes: usize,

    /// Target pixel count for previews (0 means default)
    pub preview_pixel_budget: u32,

    /// Where preview files live. `None` uses the user cache directory.
    pub preview_dir: Option<PathBuf>,

    pub resize_filter: ResizeFilter,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_concurrent_decodes: DEFAULT_MAX_CONCURRENT_DECODES,
            preview_pixel_budget: DEFAULT_PREVIEW_PIXEL_BUDGET,
            preview_dir: None,
            resize_filter: ResizeFilter::default(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Self>(json).map(Self::validated)
    }

    /// Replace zero limits with defaults.
    pub fn validated(mut self) -> Self {
        if self.max_concurrent_decodes == 0 {
            self.max_concurrent_decodes = DEFAULT_MAX_CONCURRENT_DECODES;
        }
        if self.preview_pixel_budget == 0 {
            self.preview_pixel_budget = DEFAULT_PREVIEW_PIXEL_BUDGET;
        }
        self
    }

    /// Resolved preview directory.
    /// Returns ~/.cache/preview-cache/previews on Linux when unset.
    pub fn preview_dir(&self) -> Option<PathBuf> {
        if let Some(dir) = &self.preview_dir {
            return Some(dir.clone());
        }
        let mut path = dirs_next::cache_dir().or_else(dirs_next::home_dir)?;
        path.push("preview-cache");
        path.push("previews");
        Some(path)
    }

    pub fn rasterizer(&self) -> ImageRasterizer {
        ImageRasterizer::new(self.resize_filter.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.max_concurrent_decodes, 3);
        assert_eq!(config.preview_pixel_budget, 2500);
        assert_eq!(config.resize_filter, ResizeFilter::Triangle);
    }

    #[test]
    fn test_serialization() {
        let mut config = CacheConfig::default();
        config.preview_dir = Some(PathBuf::from("/tmp/previews"));
        config.resize_filter = ResizeFilter::Lanczos3;

        let json = config.to_json().unwrap();
        let restored = CacheConfig::from_json(&json).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn test_partial_json_and_zero_limits() {
        let config = CacheConfig::from_json(r#"{"max_concurrent_decodes": 0, "resize_filter": "nearest"}"#)
            .unwrap();
        assert_eq!(config.max_concurrent_decodes, 3);
        assert_eq!(config.preview_pixel_budget, 2500);
        assert_eq!(config.resize_filter, ResizeFilter::Nearest);
    }

    #[test]
    fn test_explicit_preview_dir_wins() {
        let config = CacheConfig {
            preview_dir: Some(PathBuf::from("/srv/previews")),
            ..CacheConfig::default()
        };
        assert_eq!(config.preview_dir(), Some(PathBuf::from("/srv/previews")));
    }
}
