use opencv::prelude::*;
use opencv::{core, imgproc};
use rayon::prelude::*;

use crate::error::Result;
use crate::image_io::to_intensity;
use crate::opencv_compat;
use crate::table::LevelTable;

/// Window of the local-energy blur applied to squared Laplacian bands.
const ENERGY_WINDOW: i32 = 3;

/// Local high-frequency energy of one Laplacian band.
///
/// Squares the band per channel and smooths it with a small Gaussian so a
/// single noisy pixel cannot dominate the decision. Shape and channel count
/// are preserved.
pub fn sharpness_map(laplacian: &Mat) -> Result<Mat> {
    let mut squared = Mat::default();
    core::multiply(laplacian, laplacian, &mut squared, 1.0, -1)?;

    let mut energy = Mat::default();
    opencv_compat::gaussian_blur(&squared, &mut energy, ENERGY_WINDOW, 0.0)?;
    Ok(energy)
}

/// Sharpness maps for every (image, level) cell; images run in parallel.
pub fn compute_sharpness_maps(laplacians: &LevelTable<Mat>) -> Result<LevelTable<Mat>> {
    let rows: Vec<Vec<Mat>> = (0..laplacians.images())
        .into_par_iter()
        .map(|image| laplacians.row(image).iter().map(sharpness_map).collect())
        .collect::<Result<_>>()?;

    for (image, row) in rows.iter().enumerate() {
        for (level, map) in row.iter().enumerate() {
            log::debug!(
                "Sharpness image {} level {}: {}x{}",
                image,
                level,
                map.cols(),
                map.rows()
            );
        }
    }
    LevelTable::from_rows(rows, laplacians.levels())
}

/// Variance of the 3x3-aperture Laplacian of the intensity image, optionally
/// restricted to the non-zero pixels of `mask`.
pub fn laplacian_variance(frame: &Mat, mask: Option<&Mat>) -> Result<f64> {
    let gray = to_intensity(frame)?;

    let mut laplacian = Mat::default();
    imgproc::laplacian(
        &gray,
        &mut laplacian,
        core::CV_32F,
        3,
        1.0,
        0.0,
        core::BORDER_DEFAULT,
    )?;

    let mask = mask.cloned().unwrap_or_default();
    let mut lap_mean = Mat::default();
    let mut lap_stddev = Mat::default();
    core::mean_std_dev(&laplacian, &mut lap_mean, &mut lap_stddev, &mask)?;
    let stddev = *lap_stddev.at_2d::<f64>(0, 0)?;
    Ok(stddev * stddev)
}

/// Global sharpness score of a frame (0.0 = flat, higher = sharper).
pub fn frame_sharpness(frame: &Mat) -> Result<f64> {
    laplacian_variance(frame, None)
}
