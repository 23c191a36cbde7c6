use opencv::core::{self, Scalar};
use opencv::prelude::*;
use rayon::prelude::*;

use crate::config::TopFusion;
use crate::error::{Result, StackError};
use crate::pyramid;
use crate::table::LevelTable;

/// Repeat a single-channel mask so it can multiply a `channels`-channel band.
fn broadcast(mask: &Mat, channels: i32) -> Result<Mat> {
    if channels == mask.channels() {
        return Ok(mask.clone());
    }
    let mut planes = core::Vector::<Mat>::new();
    for _ in 0..channels {
        planes.push(mask.clone());
    }
    let mut out = Mat::default();
    core::merge(&planes, &mut out)?;
    Ok(out)
}

fn fuse_level(level: usize, bands: &[&Mat], masks: &[&Mat]) -> Result<Mat> {
    let first = bands[0];
    let mut fused = Mat::new_rows_cols_with_default(
        first.rows(),
        first.cols(),
        first.typ(),
        Scalar::all(0.0),
    )?;

    for (image, (band, mask)) in bands.iter().zip(masks).enumerate() {
        if band.size()? != first.size()? || mask.size()? != first.size()? {
            return Err(StackError::shape_mismatch(format!(
                "image {} level {}: band {}x{}, mask {}x{}, expected {}x{}",
                image,
                level,
                band.cols(),
                band.rows(),
                mask.cols(),
                mask.rows(),
                first.cols(),
                first.rows()
            )));
        }
        let weight = broadcast(mask, band.channels())?;
        let mut weighted = Mat::default();
        core::multiply(*band, &weight, &mut weighted, 1.0, -1)?;
        let mut sum = Mat::default();
        core::add(&fused, &weighted, &mut sum, &core::no_array(), -1)?;
        fused = sum;
    }
    Ok(fused)
}

/// Per level, the mask-weighted sum of every image's Laplacian band.
pub fn fuse_laplacians(
    laplacians: &LevelTable<Mat>,
    masks: &LevelTable<Mat>,
) -> Result<Vec<Mat>> {
    if laplacians.images() != masks.images() || laplacians.levels() != masks.levels() {
        return Err(StackError::shape_mismatch(format!(
            "{}x{} Laplacian bands but {}x{} masks",
            laplacians.images(),
            laplacians.levels(),
            masks.images(),
            masks.levels()
        )));
    }
    if laplacians.images() == 0 {
        return Err(StackError::input("no Laplacian pyramids to fuse"));
    }

    (0..laplacians.levels())
        .into_par_iter()
        .map(|level| {
            let bands: Vec<&Mat> = laplacians.column(level).collect();
            let weights: Vec<&Mat> = masks.column(level).collect();
            fuse_level(level, &bands, &weights)
        })
        .collect()
}

/// Combine the coarsest Gaussian band of every image into one base band.
pub fn fuse_top(tops: &[Mat], method: TopFusion) -> Result<Mat> {
    let (first, rest) = tops
        .split_first()
        .ok_or_else(|| StackError::input("no top Gaussian bands to fuse"))?;

    let mut acc = Mat::default();
    first.convert_to(&mut acc, core::CV_32F, 1.0, 0.0)?;
    for top in rest {
        if top.size()? != acc.size()? {
            return Err(StackError::shape_mismatch(
                "top Gaussian bands differ in size".to_string(),
            ));
        }
        let mut next = Mat::default();
        match method {
            TopFusion::Mean => core::add(&acc, top, &mut next, &core::no_array(), -1)?,
            TopFusion::Max => core::max(&acc, top, &mut next)?,
        }
        acc = next;
    }

    match method {
        TopFusion::Mean if !rest.is_empty() => {
            let mut mean = Mat::default();
            acc.convert_to(&mut mean, core::CV_32F, 1.0 / tops.len() as f64, 0.0)?;
            Ok(mean)
        }
        _ => Ok(acc),
    }
}

/// Collapse the fused pyramid onto the fused base band and clip to [0, 255].
pub fn reconstruct(fused_laplacians: &[Mat], fused_top: &Mat) -> Result<Mat> {
    let collapsed = pyramid::collapse(fused_laplacians, fused_top)?;

    let mut upper = Mat::default();
    core::min(&collapsed, &Scalar::all(255.0), &mut upper)?;
    let mut clipped = Mat::default();
    core::max(&upper, &Scalar::all(0.0), &mut clipped)?;
    Ok(clipped)
}
