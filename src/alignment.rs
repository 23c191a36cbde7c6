//! ECC registration of every frame onto the first frame of the stack.

use opencv::core::{self, Scalar};
use opencv::prelude::*;
use opencv::{imgproc, video};
use rayon::prelude::*;

use crate::error::Result;
use crate::image_io::{to_intensity, ImageStack};
use crate::opencv_compat;

/// Hard ceiling on ECC iterations.
pub const ECC_MAX_ITERATIONS: i32 = 500;
/// ECC stops once the warp update is smaller than this.
pub const ECC_EPSILON: f64 = 1e-5;
/// Pre-smoothing window ECC applies to both images.
const ECC_GAUSS_FILTER_SIZE: i32 = 5;
/// Smallest |det| accepted for the linear part of the warp.
const MIN_WARP_DETERMINANT: f64 = 1e-6;

/// What happened to one frame during alignment.
#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentOutcome {
    /// Frame 0, passed through untouched.
    Reference,
    /// Warped onto the reference; `correlation` is the final ECC value.
    Aligned { correlation: f64 },
    /// Kept unaligned because the optimizer failed or produced a degenerate warp.
    Unaligned { reason: String },
}

/// Affine warp mapping reference pixel coordinates to candidate coordinates.
fn estimate_warp(reference_gray: &Mat, frame_gray: &Mat) -> opencv::Result<(Mat, f64)> {
    let mut warp = Mat::eye(2, 3, core::CV_32F)?.to_mat()?;
    let criteria = core::TermCriteria::new(
        core::TermCriteria_Type::COUNT as i32 + core::TermCriteria_Type::EPS as i32,
        ECC_MAX_ITERATIONS,
        ECC_EPSILON,
    )?;
    let correlation = opencv_compat::find_transform_ecc(
        reference_gray,
        frame_gray,
        &mut warp,
        video::MOTION_AFFINE,
        criteria,
        ECC_GAUSS_FILTER_SIZE,
    )?;
    Ok((warp, correlation))
}

/// Rejects warps with non-finite entries or a (near) singular linear part.
fn degenerate_reason(warp: &Mat) -> Result<Option<String>> {
    let m = warp.data_typed::<f32>()?;
    if m.iter().any(|v| !v.is_finite()) {
        return Ok(Some("warp has non-finite entries".to_string()));
    }
    let det = m[0] as f64 * m[4] as f64 - m[1] as f64 * m[3] as f64;
    if det.abs() < MIN_WARP_DETERMINANT {
        return Ok(Some(format!("warp is degenerate (det = {:.3e})", det)));
    }
    Ok(None)
}

/// Register one frame. Optimizer failures are absorbed: the frame comes back
/// unchanged with an `Unaligned` outcome.
pub fn align_frame(reference_gray: &Mat, frame: &Mat) -> Result<(Mat, AlignmentOutcome)> {
    let frame_gray = to_intensity(frame)?;

    let (warp, correlation) = match estimate_warp(reference_gray, &frame_gray) {
        Ok(found) => found,
        Err(e) => {
            let reason = format!("ECC did not converge: {}", e.message);
            return Ok((frame.clone(), AlignmentOutcome::Unaligned { reason }));
        }
    };
    if let Some(reason) = degenerate_reason(&warp)? {
        return Ok((frame.clone(), AlignmentOutcome::Unaligned { reason }));
    }

    // the warp maps reference -> candidate, so sample the candidate through it
    let mut aligned = Mat::default();
    imgproc::warp_affine(
        frame,
        &mut aligned,
        &warp,
        reference_gray.size()?,
        imgproc::INTER_LINEAR | imgproc::WARP_INVERSE_MAP,
        core::BORDER_REPLICATE,
        Scalar::default(),
    )?;
    Ok((aligned, AlignmentOutcome::Aligned { correlation }))
}

/// Warp every frame onto frame 0 under an affine model.
///
/// Frames are registered independently on the rayon pool. The returned stack
/// has the same length, order and shapes as the input.
pub fn align_stack(stack: ImageStack) -> Result<(ImageStack, Vec<AlignmentOutcome>)> {
    let start = std::time::Instant::now();
    let reference_gray = to_intensity(stack.reference())?;
    let mut frames = stack.into_frames();
    log::info!("Aligning {} frames to frame 0 (ECC, affine)", frames.len() - 1);

    let mut results: Vec<(Mat, AlignmentOutcome)> = frames
        .par_iter()
        .enumerate()
        .skip(1)
        .map(|(idx, frame)| {
            let (aligned, outcome) = align_frame(&reference_gray, frame)?;
            match &outcome {
                AlignmentOutcome::Aligned { correlation } => {
                    log::info!("Frame {}: aligned, correlation = {:.4}", idx, correlation)
                }
                AlignmentOutcome::Unaligned { reason } => {
                    log::warn!("Alignment failed for frame {}, keeping original: {}", idx, reason)
                }
                AlignmentOutcome::Reference => {}
            }
            Ok((aligned, outcome))
        })
        .collect::<Result<_>>()?;

    frames.truncate(1);
    results.insert(0, (frames.swap_remove(0), AlignmentOutcome::Reference));

    let (aligned, outcomes): (Vec<Mat>, Vec<AlignmentOutcome>) = results.into_iter().unzip();
    log::info!("Alignment completed in {:?}", start.elapsed());
    Ok((ImageStack::new(aligned)?, outcomes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pyramid::tests::textured;

    /// Smooth texture ECC can lock onto.
    fn scene() -> Mat {
        let noise = textured(120, 160, 3, 21);
        let mut smooth = Mat::default();
        opencv_compat::gaussian_blur(&noise, &mut smooth, 0, 4.0).unwrap();
        // stretch contrast back up after the blur flattened it
        let mut out = Mat::default();
        smooth.convert_to(&mut out, core::CV_32F, 6.0, -640.0).unwrap();
        out
    }

    fn translate(frame: &Mat, dx: f32, dy: f32) -> Mat {
        let m = Mat::from_slice_2d(&[[1.0f32, 0.0, dx], [0.0, 1.0, dy]]).unwrap();
        let mut out = Mat::default();
        imgproc::warp_affine(
            frame,
            &mut out,
            &m,
            frame.size().unwrap(),
            imgproc::INTER_LINEAR,
            core::BORDER_REPLICATE,
            Scalar::default(),
        )
        .unwrap();
        out
    }

    /// Mean absolute difference away from the borders.
    fn interior_error(a: &Mat, b: &Mat) -> f64 {
        let mut diff = Mat::default();
        core::absdiff(a, b, &mut diff).unwrap();
        let mut region =
            Mat::new_rows_cols_with_default(a.rows(), a.cols(), core::CV_8U, Scalar::all(0.0))
                .unwrap();
        imgproc::rectangle(
            &mut region,
            core::Rect::new(15, 15, a.cols() - 30, a.rows() - 30),
            Scalar::all(255.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let mean = core::mean(&diff, &region).unwrap();
        (mean[0] + mean[1] + mean[2]) / 3.0
    }

    #[test]
    fn test_translated_frame_is_registered() -> Result<()> {
        let reference = scene();
        let shifted = translate(&reference, 2.5, -1.5);
        let before = interior_error(&reference, &shifted);

        let stack = ImageStack::new(vec![reference.clone(), shifted])?;
        let (aligned, outcomes) = align_stack(stack)?;

        assert_eq!(outcomes[0], AlignmentOutcome::Reference);
        assert!(matches!(outcomes[1], AlignmentOutcome::Aligned { .. }));
        let after = interior_error(&reference, &aligned.frames()[1]);
        assert!(after < before / 4.0, "error {} -> {}", before, after);
        Ok(())
    }

    #[test]
    fn test_reference_frame_is_untouched() -> Result<()> {
        let reference = scene();
        let stack = ImageStack::new(vec![reference.clone(), translate(&reference, 1.0, 1.0)])?;
        let (aligned, _) = align_stack(stack)?;
        let mut diff = Mat::default();
        core::absdiff(&reference, &aligned.frames()[0], &mut diff)?;
        assert_eq!(core::sum_elems(&diff)?, Scalar::all(0.0));
        Ok(())
    }

    #[test]
    fn test_featureless_frame_passes_through() -> Result<()> {
        let flat = Mat::new_rows_cols_with_default(40, 40, core::CV_32FC3, Scalar::all(90.0))?;
        let stack = ImageStack::new(vec![flat.clone(), flat.clone(), flat.clone()])?;
        let (aligned, outcomes) = align_stack(stack)?;
        assert_eq!(aligned.len(), 3);
        assert_eq!(outcomes.len(), 3);
        for frame in aligned.frames() {
            assert_eq!(frame.size()?, flat.size()?);
            let mut diff = Mat::default();
            core::absdiff(&flat, frame, &mut diff)?;
            let total = core::sum_elems(&diff)?;
            assert!(total[0] + total[1] + total[2] < 1e-2);
        }
        Ok(())
    }

    #[test]
    fn test_degenerate_warps_are_rejected() -> Result<()> {
        let identity = Mat::from_slice_2d(&[[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0]])?;
        assert_eq!(degenerate_reason(&identity)?, None);

        let singular = Mat::from_slice_2d(&[[0.0f32, 0.0, 0.0], [0.0, 0.0, 0.0]])?;
        assert!(degenerate_reason(&singular)?.is_some());

        let nan = Mat::from_slice_2d(&[[1.0f32, f32::NAN, 0.0], [0.0, 1.0, 0.0]])?;
        assert!(degenerate_reason(&nan)?.is_some());
        Ok(())
    }

    #[test]
    fn test_unregistrable_frame_is_kept_unaligned() -> Result<()> {
        let reference_gray = to_intensity(&scene())?;
        let flat = Mat::new_rows_cols_with_default(120, 160, core::CV_32FC3, Scalar::all(90.0))?;

        let (kept, outcome) = align_frame(&reference_gray, &flat)?;
        assert!(matches!(outcome, AlignmentOutcome::Unaligned { .. }), "{:?}", outcome);

        let mut diff = Mat::default();
        core::absdiff(&flat, &kept, &mut diff)?;
        assert_eq!(core::sum_elems(&diff)?, Scalar::all(0.0));
        Ok(())
    }

    #[test]
    fn test_single_frame_stack() -> Result<()> {
        let (aligned, outcomes) = align_stack(ImageStack::new(vec![scene()])?)?;
        assert_eq!(aligned.len(), 1);
        assert_eq!(outcomes, vec![AlignmentOutcome::Reference]);
        Ok(())
    }
}
