use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, StackError};

/// How per-level decision masks are turned into blending weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskMode {
    /// Blurred one-hot masks, renormalized to sum to one per pixel.
    Soft,
    /// Raw one-hot masks, winner takes all.
    Hard,
}

impl std::fmt::Display for MaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaskMode::Soft => write!(f, "soft"),
            MaskMode::Hard => write!(f, "hard"),
        }
    }
}

/// Reducer applied to the coarsest Gaussian band of every image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopFusion {
    Mean,
    Max,
}

impl std::fmt::Display for TopFusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopFusion::Mean => write!(f, "mean"),
            TopFusion::Max => write!(f, "max"),
        }
    }
}

/// Decoding mode used when frames are read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    Color,
    Grayscale,
}

impl std::fmt::Display for ColorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColorMode::Color => write!(f, "color"),
            ColorMode::Grayscale => write!(f, "grayscale"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub levels: usize,
    pub mask_mode: MaskMode,
    pub top_fusion: TopFusion,
    pub smoothing_sigma: f64,
    pub smoothing_kernel_size: i32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            levels: 4,
            mask_mode: MaskMode::Soft,
            top_fusion: TopFusion::Mean,
            smoothing_sigma: 1.0,
            smoothing_kernel_size: 5,
        }
    }
}

impl FusionConfig {
    /// Parameters the command-line driver runs with: wider mask smoothing
    /// and a max-reduced base band.
    pub fn production() -> Self {
        Self {
            levels: 4,
            mask_mode: MaskMode::Soft,
            top_fusion: TopFusion::Max,
            smoothing_sigma: 1.2,
            smoothing_kernel_size: 7,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.smoothing_sigma.is_finite() && self.smoothing_sigma > 0.0) {
            return Err(StackError::invalid_config(format!(
                "smoothing_sigma must be a positive number, got {}",
                self.smoothing_sigma
            )));
        }
        if self.smoothing_kernel_size <= 0 || self.smoothing_kernel_size % 2 == 0 {
            return Err(StackError::invalid_config(format!(
                "smoothing_kernel_size must be odd and positive, got {}",
                self.smoothing_kernel_size
            )));
        }
        Ok(())
    }
}

/// Everything the command-line driver needs besides the input directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackerSettings {
    pub fusion: FusionConfig,
    pub file_extension: String,
    pub color_mode: ColorMode,
    pub use_cache: bool,
    /// Defaults to `<output_dir>/cache` when unset.
    pub cache_dir: Option<PathBuf>,
    pub debug_output: bool,
    pub output_dir: PathBuf,
}

impl Default for StackerSettings {
    fn default() -> Self {
        Self {
            fusion: FusionConfig::production(),
            file_extension: "png".to_string(),
            color_mode: ColorMode::Color,
            use_cache: true,
            cache_dir: None,
            debug_output: true,
            output_dir: PathBuf::from("output"),
        }
    }
}

impl StackerSettings {
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.join("cache"))
    }
}
