//! Gaussian and Laplacian pyramids (Burt & Adelson).
//!
//! Downsampling is `pyrDown` (5-tap Gaussian, `ceil(n / 2)` output size) and
//! every upsampling call is given the exact size of the finer level, so odd
//! dimensions reconstruct to the original size.

use opencv::prelude::*;
use opencv::{core, imgproc};
use rayon::prelude::*;

use crate::error::{Result, StackError};
use crate::table::LevelTable;

/// `G0..=G(levels)`, finest first.
pub fn build_gaussian(frame: &Mat, levels: usize) -> Result<Vec<Mat>> {
    let mut pyramid = Vec::with_capacity(levels + 1);
    pyramid.push(frame.clone());
    for _ in 0..levels {
        let mut down = Mat::default();
        imgproc::pyr_down(
            &pyramid[pyramid.len() - 1],
            &mut down,
            core::Size::default(),
            core::BORDER_DEFAULT,
        )?;
        pyramid.push(down);
    }
    Ok(pyramid)
}

/// Upsample `src` to exactly `size` with the complementary interpolation filter.
pub fn upsample_to(src: &Mat, size: core::Size) -> Result<Mat> {
    let mut up = Mat::default();
    imgproc::pyr_up(src, &mut up, size, core::BORDER_DEFAULT)?;
    Ok(up)
}

/// Split a Gaussian pyramid into its band-pass residuals and the coarsest level.
///
/// Returns `(laplacians, top)` where `laplacians.len() == gaussian.len() - 1`
/// and `laplacians[k]` has the size of `gaussian[k]`.
pub fn build_laplacian(gaussian: Vec<Mat>) -> Result<(Vec<Mat>, Mat)> {
    let mut levels = gaussian.into_iter();
    let Some(mut current) = levels.next() else {
        return Err(StackError::input("empty Gaussian pyramid"));
    };

    let mut laplacians = Vec::with_capacity(levels.len());
    for coarser in levels {
        let up = upsample_to(&coarser, current.size()?)?;
        let mut lap = Mat::default();
        core::subtract(&current, &up, &mut lap, &core::no_array(), -1)?;
        laplacians.push(lap);
        current = coarser;
    }
    Ok((laplacians, current))
}

/// Laplacian bands of every image plus each image's top Gaussian.
#[derive(Debug, Clone)]
pub struct StackPyramids {
    pub laplacians: LevelTable<Mat>,
    pub tops: Vec<Mat>,
}

/// Build every image's pyramid. Images are independent and run on the rayon pool;
/// `on_gaussian` sees each image's Gaussian levels before they are consumed.
pub fn build_pyramids(
    frames: &[Mat],
    levels: usize,
    on_gaussian: impl Fn(usize, &[Mat]) + Sync,
) -> Result<StackPyramids> {
    let per_image: Vec<(Vec<Mat>, Mat)> = frames
        .par_iter()
        .enumerate()
        .map(|(idx, frame)| {
            let gaussian = build_gaussian(frame, levels)?;
            on_gaussian(idx, &gaussian);
            build_laplacian(gaussian)
        })
        .collect::<Result<_>>()?;

    let (rows, tops): (Vec<_>, Vec<_>) = per_image.into_iter().unzip();
    Ok(StackPyramids {
        laplacians: LevelTable::from_rows(rows, levels)?,
        tops,
    })
}

/// Collapse a Laplacian pyramid onto its top band, coarsest level first.
/// No clipping is applied here.
pub fn collapse(laplacians: &[Mat], top: &Mat) -> Result<Mat> {
    let mut current = top.clone();
    for lap in laplacians.iter().rev() {
        let up = upsample_to(&current, lap.size()?)?;
        let mut next = Mat::default();
        core::add(&up, lap, &mut next, &core::no_array(), -1)?;
        current = next;
    }
    Ok(current)
}
