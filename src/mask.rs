//! Decision masks for multi-focus fusion.
//!
//! Raw masks are one-hot: at each pixel of each level the image with the
//! highest sharpness gets 1, every other image 0. Soft masks blur the raw
//! masks and renormalize them so the weights of all images sum to one.

use opencv::core::{self, Scalar};
use opencv::prelude::*;
use rayon::prelude::*;

use crate::config::MaskMode;
use crate::error::{Result, StackError};
use crate::opencv_compat;
use crate::table::LevelTable;

/// Keeps pixels whose blurred weights all vanished from dividing by zero.
const NORMALIZE_EPSILON: f64 = 1e-8;

/// Collapse a sharpness map to one value per pixel by summing its channels.
pub fn reduce_channels(map: &Mat) -> Result<Mat> {
    if map.channels() == 1 {
        return Ok(map.clone());
    }
    let mut planes = core::Vector::<Mat>::new();
    core::split(map, &mut planes)?;

    let mut total = planes.get(0)?;
    for plane in planes.iter().skip(1) {
        let mut sum = Mat::default();
        core::add(&total, &plane, &mut sum, &core::no_array(), -1)?;
        total = sum;
    }
    Ok(total)
}

fn zeros_like(reference: &Mat) -> Result<Mat> {
    Ok(Mat::new_rows_cols_with_default(
        reference.rows(),
        reference.cols(),
        core::CV_32FC1,
        Scalar::all(0.0),
    )?)
}

/// One-hot masks for a single level. The first image reaching the maximum wins ties.
fn raw_masks_for_level(level: usize, maps: &[&Mat]) -> Result<Vec<Mat>> {
    if maps.is_empty() {
        return Err(StackError::input("no sharpness maps to compare"));
    }
    let scalars = maps
        .iter()
        .map(|map| reduce_channels(map))
        .collect::<Result<Vec<_>>>()?;

    let size = scalars[0].size()?;
    if let Some(idx) = scalars.iter().position(|m| m.size().ok() != Some(size)) {
        return Err(StackError::shape_mismatch(format!(
            "sharpness map of image {} at level {} does not match image 0",
            idx, level
        )));
    }

    let values = scalars
        .iter()
        .map(|m| m.data_typed::<f32>())
        .collect::<opencv::Result<Vec<_>>>()?;

    let mut winners = vec![0usize; values[0].len()];
    for (pixel, winner) in winners.iter_mut().enumerate() {
        let mut best = values[0][pixel];
        for (image, image_values) in values.iter().enumerate().skip(1) {
            if image_values[pixel] > best {
                best = image_values[pixel];
                *winner = image;
            }
        }
    }

    let mut masks = Vec::with_capacity(maps.len());
    for image in 0..maps.len() {
        let mut mask = zeros_like(&scalars[0])?;
        let data = mask.data_typed_mut::<f32>()?;
        for (value, &winner) in data.iter_mut().zip(&winners) {
            if winner == image {
                *value = 1.0;
            }
        }
        masks.push(mask);
    }
    Ok(masks)
}

/// Raw one-hot decision masks, one single-channel `CV_32F` mask per (image, level).
pub fn build_raw_masks(sharpness: &LevelTable<Mat>) -> Result<LevelTable<Mat>> {
    let columns = (0..sharpness.levels())
        .into_par_iter()
        .map(|level| {
            let maps: Vec<&Mat> = sharpness.column(level).collect();
            raw_masks_for_level(level, &maps)
        })
        .collect::<Result<Vec<_>>>()?;
    LevelTable::from_columns(columns, sharpness.images())
}

fn smooth_level(masks: &[&Mat], sigma: f64, ksize: i32) -> Result<Vec<Mat>> {
    let blurred = masks
        .iter()
        .map(|mask| {
            let mut out = Mat::default();
            opencv_compat::gaussian_blur(*mask, &mut out, ksize, sigma)?;
            Ok(out)
        })
        .collect::<Result<Vec<_>>>()?;

    let pixels = blurred[0].total();
    let mut denominator = vec![NORMALIZE_EPSILON; pixels];
    for mask in &blurred {
        for (acc, &value) in denominator.iter_mut().zip(mask.data_typed::<f32>()?) {
            *acc += value as f64;
        }
    }

    let mut normalized = Vec::with_capacity(blurred.len());
    for mask in blurred {
        let mut out = zeros_like(&mask)?;
        let src = mask.data_typed::<f32>()?;
        for ((dst, &value), &denom) in out
            .data_typed_mut::<f32>()?
            .iter_mut()
            .zip(src)
            .zip(&denominator)
        {
            *dst = (value as f64 / denom) as f32;
        }
        normalized.push(out);
    }
    Ok(normalized)
}

/// Blur every raw mask and renormalize per pixel so the weights across images sum to one.
pub fn smooth_and_normalize(
    raw: &LevelTable<Mat>,
    sigma: f64,
    ksize: i32,
) -> Result<LevelTable<Mat>> {
    let columns = (0..raw.levels())
        .into_par_iter()
        .map(|level| {
            let masks: Vec<&Mat> = raw.column(level).collect();
            smooth_level(&masks, sigma, ksize)
        })
        .collect::<Result<Vec<_>>>()?;
    LevelTable::from_columns(columns, raw.images())
}

/// Blending weights for every (image, level) cell. Pure: equal inputs give equal masks.
pub fn build_masks(
    sharpness: &LevelTable<Mat>,
    mode: MaskMode,
    sigma: f64,
    ksize: i32,
) -> Result<LevelTable<Mat>> {
    let raw = build_raw_masks(sharpness)?;
    match mode {
        MaskMode::Hard => Ok(raw),
        MaskMode::Soft => smooth_and_normalize(&raw, sigma, ksize),
    }
}
