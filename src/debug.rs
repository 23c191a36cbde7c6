//! Observational per-stage artifacts.
//!
//! Nothing written here is ever read back by the stacking core.

use opencv::core;
use opencv::prelude::*;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::image_io::write_image;

/// Receives intermediate results as the pipeline produces them.
/// Every method defaults to doing nothing.
pub trait DebugSink: Sync {
    fn gaussian_level(&self, _image: usize, _level: usize, _band: &Mat) -> Result<()> {
        Ok(())
    }

    fn laplacian_level(&self, _image: usize, _level: usize, _band: &Mat) -> Result<()> {
        Ok(())
    }

    fn sharpness_map(&self, _image: usize, _level: usize, _map: &Mat) -> Result<()> {
        Ok(())
    }

    fn fused_laplacian(&self, _level: usize, _band: &Mat) -> Result<()> {
        Ok(())
    }

    fn fused_top(&self, _top: &Mat) -> Result<()> {
        Ok(())
    }
}

/// Stretch an arbitrary float map to the full 8-bit range.
fn normalize_for_display(map: &Mat) -> Result<Mat> {
    let mut out = Mat::default();
    core::normalize(
        map,
        &mut out,
        0.0,
        255.0,
        core::NORM_MINMAX,
        core::CV_8U,
        &core::no_array(),
    )?;
    Ok(out)
}

/// Writes artifacts as PNG files below one directory per stack.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn image_level_path(&self, stage: &str, image: usize, level: usize) -> PathBuf {
        self.root
            .join(stage)
            .join(format!("image_{:03}", image))
            .join(format!("level_{:02}.png", level))
    }
}

impl DebugSink for DirectorySink {
    fn gaussian_level(&self, image: usize, level: usize, band: &Mat) -> Result<()> {
        write_image(&self.image_level_path("gaussian_pyramids", image, level), band)
    }

    fn laplacian_level(&self, image: usize, level: usize, band: &Mat) -> Result<()> {
        // bands are centred on zero; shift so both signs stay visible
        let mut shifted = Mat::default();
        band.convert_to(&mut shifted, core::CV_32F, 1.0, 128.0)?;
        write_image(&self.image_level_path("laplacian_pyramids", image, level), &shifted)
    }

    fn sharpness_map(&self, image: usize, level: usize, map: &Mat) -> Result<()> {
        let path = self
            .root
            .join("sharpness_maps")
            .join(format!("image_{}_level_{}_sharpness.png", image, level));
        write_image(&path, &normalize_for_display(map)?)
    }

    fn fused_laplacian(&self, level: usize, band: &Mat) -> Result<()> {
        let path = self
            .root
            .join("fused_pyramids")
            .join(format!("fused_laplacian_level_{}.png", level));
        write_image(&path, &normalize_for_display(band)?)
    }

    fn fused_top(&self, top: &Mat) -> Result<()> {
        let path = self.root.join("fused_pyramids").join("fused_top_gaussian.png");
        write_image(&path, &normalize_for_display(top)?)
    }
}
