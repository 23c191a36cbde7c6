//! OpenCV compatibility wrappers for cross-version support.
//!
//! OpenCV 4.11 added an `AlgorithmHint` parameter to `cvt_color` and
//! `gaussian_blur`, and the opencv crate generates different signatures
//! depending on the installed headers. The `_def` variants exist on every
//! version, so the stacking code calls these wrappers instead.

use opencv::core::{ToInputArray, ToInputOutputArray, ToOutputArray};
use opencv::{core, imgproc, video, Result};

/// `cvt_color` with the default destination channel count.
pub fn cvt_color(src: &impl ToInputArray, dst: &mut impl ToOutputArray, code: i32) -> Result<()> {
    imgproc::cvt_color_def(src, dst, code)
}

/// Gaussian blur with a square window, `sigma_y == sigma_x` and the default
/// (reflect-101) border. A `sigma` of 0 derives the sigma from the window.
pub fn gaussian_blur(
    src: &impl ToInputArray,
    dst: &mut impl ToOutputArray,
    ksize: i32,
    sigma: f64,
) -> Result<()> {
    imgproc::gaussian_blur_def(src, dst, core::Size::new(ksize, ksize), sigma)
}

/// ECC registration without an input mask.
///
/// Returns the final correlation coefficient; `warp` is refined in place.
pub fn find_transform_ecc(
    template: &impl ToInputArray,
    input: &impl ToInputArray,
    warp: &mut impl ToInputOutputArray,
    motion_type: i32,
    criteria: core::TermCriteria,
    gauss_filt_size: i32,
) -> Result<f64> {
    video::find_transform_ecc(
        template,
        input,
        warp,
        motion_type,
        criteria,
        &core::Mat::default(),
        gauss_filt_size,
    )
}
