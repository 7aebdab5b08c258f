//! Detection and matching tunables.
//!
//! Values come from built-in defaults, optionally overridden by a TOML file
//! and then by `FACENET_*` environment variables. The resulting [`Config`] is
//! handed to the extractor and the identity store at construction and never
//! mutated afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Slack added to an identity's radius before a match is rejected as too far.
pub const DEFAULT_MATCH_DIST: f64 = 0.46;
/// Base quality score a detection must reach at large scales.
pub const DEFAULT_SCORE_THRESHOLD: f32 = 4.0;
/// Crop-area overlap (percent) above which two faces are the same face.
pub const DEFAULT_OVERLAP_THRESHOLD: i32 = 42;
/// Longer side of the image fed to the detector.
pub const DEFAULT_MAX_IMAGE_SIZE: u32 = 640;
/// Side length of the thumbnail handed to the embedding model.
pub const DEFAULT_CROP_SIZE: u32 = 160;
/// Smallest face the cascade is asked to find, in pixels.
pub const DEFAULT_MIN_FACE_SIZE: u32 = 20;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.2;
pub const DEFAULT_SHIFT_FACTOR: f32 = 0.1;
pub const DEFAULT_SCALE_FACTOR: f32 = 1.1;
/// Perturbation count for pupil and landmark cascades.
pub const DEFAULT_PERTURBS: u32 = 63;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Immutable tunables shared by detection and identity matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub match_dist: f64,
    pub score_threshold: f32,
    pub overlap_threshold: i32,
    pub max_image_size: u32,
    pub crop_size: u32,
    pub min_face_size: u32,
    pub iou_threshold: f32,
    pub shift_factor: f32,
    pub scale_factor: f32,
    pub perturbs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            match_dist: DEFAULT_MATCH_DIST,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            crop_size: DEFAULT_CROP_SIZE,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            shift_factor: DEFAULT_SHIFT_FACTOR,
            scale_factor: DEFAULT_SCALE_FACTOR,
            perturbs: DEFAULT_PERTURBS,
        }
    }
}

impl Config {
    /// Defaults overridden by `FACENET_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Read a TOML file (missing keys keep their defaults), then apply
    /// `FACENET_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let path_display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path_display.clone(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Toml {
            path: path_display.clone(),
            source,
        })?;
        tracing::debug!(path = %path_display, "loaded config file");
        Ok(config.with_env_overrides())
    }

    fn with_env_overrides(self) -> Self {
        Self {
            match_dist: env_or("FACENET_MATCH_DIST", self.match_dist),
            score_threshold: env_or("FACENET_SCORE_THRESHOLD", self.score_threshold),
            overlap_threshold: env_or("FACENET_OVERLAP_THRESHOLD", self.overlap_threshold),
            max_image_size: env_or("FACENET_MAX_IMAGE_SIZE", self.max_image_size),
            crop_size: env_or("FACENET_CROP_SIZE", self.crop_size),
            min_face_size: env_or("FACENET_MIN_FACE_SIZE", self.min_face_size),
            iou_threshold: env_or("FACENET_IOU_THRESHOLD", self.iou_threshold),
            shift_factor: env_or("FACENET_SHIFT_FACTOR", self.shift_factor),
            scale_factor: env_or("FACENET_SCALE_FACTOR", self.scale_factor),
            perturbs: env_or("FACENET_PERTURBS", self.perturbs),
        }
    }

    /// Scale-adjusted quality threshold for this configuration.
    pub fn quality_threshold(&self, scale: i32) -> f32 {
        quality_threshold(self.score_threshold, scale)
    }
}

/// Scale-adjusted quality threshold. Smaller faces need a higher score.
pub fn quality_threshold(score_threshold: f32, scale: i32) -> f32 {
    score_threshold + small_face_penalty(scale)
}

fn small_face_penalty(scale: i32) -> f32 {
    match scale {
        s if s < 26 => 26.0,
        s if s < 32 => 16.0,
        s if s < 40 => 11.0,
        s if s < 50 => 9.0,
        s if s < 80 => 6.0,
        s if s < 110 => 2.0,
        _ => 0.0,
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
