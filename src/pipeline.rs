//! End-to-end focus stacking: pyramids, sharpness, masks, fusion, reconstruction.

use opencv::prelude::*;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::alignment::{align_stack, AlignmentOutcome};
use crate::cache::StackCache;
use crate::config::{FusionConfig, StackerSettings};
use crate::debug::DebugSink;
use crate::error::{Result, StackError};
use crate::fusion::{fuse_laplacians, fuse_top, reconstruct};
use crate::image_io::{ensure_same_size, load_stack, ImageStack};
use crate::mask::build_masks;
use crate::pyramid::build_pyramids;
use crate::sharpness::{compute_sharpness_maps, frame_sharpness};

pub type ProgressCallback = Arc<Mutex<dyn FnMut(String, f32) + Send>>;

fn report(progress: &Option<ProgressCallback>, msg: &str, pct: f32) {
    if let Some(ref cb) = progress {
        if let Ok(mut cb_lock) = cb.lock() {
            cb_lock(msg.to_string(), pct);
        }
    }
}

/// Debug output is best effort; a failing sink never stops the stack.
fn emit(result: Result<()>, what: &str) {
    if let Err(e) = result {
        log::warn!("Failed to write debug {}: {}", what, e);
    }
}

/// Name of the stack in `directory`, taken from its canonical path so that
/// `.` or `sub/..` name the directory they point at.
pub fn stack_name(directory: &Path) -> String {
    let resolved = directory
        .canonicalize()
        .unwrap_or_else(|_| directory.to_path_buf());
    resolved
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "stack".to_string())
}

/// Cache key for the aligned stack in `directory`. Decoding options are part
/// of the key, so a grayscale run never reuses a color entry.
pub fn cache_key(directory: &Path, settings: &StackerSettings) -> String {
    format!(
        "{}_{}_{}_aligned",
        stack_name(directory),
        settings.file_extension.trim_start_matches('.').to_ascii_lowercase(),
        settings.color_mode
    )
}

/// Load, normalize and align the stack in `directory`, going through `cache`
/// when one is given. Cache failures are logged and otherwise ignored.
pub fn preprocess_stack(
    directory: &Path,
    settings: &StackerSettings,
    cache: Option<&dyn StackCache>,
    progress: Option<ProgressCallback>,
) -> Result<ImageStack> {
    report(&progress, "Preparing stack...", 0.0);
    let key = cache_key(directory, settings);

    if let Some(cache) = cache {
        match cache.load_cached(&key) {
            Ok(Some(stack)) => {
                log::info!("Using cached aligned stack '{}' ({} frames)", key, stack.len());
                report(&progress, "Loaded aligned stack from cache", 100.0);
                return Ok(stack);
            }
            Ok(None) => log::info!("No cached stack for '{}'", key),
            Err(e) => log::warn!("Cache lookup for '{}' failed: {:#}", key, e),
        }
    }

    report(&progress, "Loading images...", 10.0);
    let frames = load_stack(directory, &settings.file_extension, settings.color_mode)?;
    let stack = ensure_same_size(frames)?;
    let size = stack.size()?;
    log::info!(
        "Loaded {} frames of {}x{} with {} channels",
        stack.len(),
        size.width,
        size.height,
        stack.channels()
    );
    for (idx, frame) in stack.frames().iter().enumerate() {
        log::info!("Frame {}: sharpness = {:.2}", idx, frame_sharpness(frame)?);
    }

    report(&progress, "Aligning images...", 30.0);
    let (aligned, outcomes) = align_stack(stack)?;
    let failed = outcomes
        .iter()
        .filter(|o| matches!(o, AlignmentOutcome::Unaligned { .. }))
        .count();
    if failed > 0 {
        log::warn!("{} of {} frames kept unaligned", failed, outcomes.len());
    }

    if let Some(cache) = cache {
        report(&progress, "Caching aligned stack...", 90.0);
        if let Err(e) = cache.store(&key, &aligned) {
            log::warn!("Could not cache aligned stack '{}': {:#}", key, e);
        }
    }

    report(&progress, "Stack prepared", 100.0);
    Ok(aligned)
}

/// Fuse an aligned stack into one all-in-focus frame.
pub fn run_pipeline(stack: &ImageStack, config: &FusionConfig) -> Result<Mat> {
    run_pipeline_with(stack, config, None, None)
}

/// [`run_pipeline`] with optional debug artifacts and progress reporting.
pub fn run_pipeline_with(
    stack: &ImageStack,
    config: &FusionConfig,
    sink: Option<&dyn DebugSink>,
    progress: Option<ProgressCallback>,
) -> Result<Mat> {
    config.validate()?;
    let start = Instant::now();
    log::info!(
        "Fusing {} frames: levels={}, mask={}, top={}, sigma={}, kernel={}",
        stack.len(),
        config.levels,
        config.mask_mode,
        config.top_fusion,
        config.smoothing_sigma,
        config.smoothing_kernel_size
    );

    report(&progress, "Building pyramids...", 0.0);
    let pyramids = build_pyramids(stack.frames(), config.levels, |image, gaussian| {
        if let Some(sink) = sink {
            for (level, band) in gaussian.iter().enumerate() {
                emit(sink.gaussian_level(image, level, band), "Gaussian level");
            }
        }
    })?;
    if let Some(sink) = sink {
        for image in 0..pyramids.laplacians.images() {
            for (level, band) in pyramids.laplacians.row(image).iter().enumerate() {
                emit(sink.laplacian_level(image, level, band), "Laplacian level");
            }
        }
    }

    report(&progress, "Computing sharpness...", 25.0);
    let sharpness = compute_sharpness_maps(&pyramids.laplacians)?;
    if let Some(sink) = sink {
        for image in 0..sharpness.images() {
            for (level, map) in sharpness.row(image).iter().enumerate() {
                emit(sink.sharpness_map(image, level, map), "sharpness map");
            }
        }
    }

    report(&progress, "Building masks...", 45.0);
    let masks = build_masks(
        &sharpness,
        config.mask_mode,
        config.smoothing_sigma,
        config.smoothing_kernel_size,
    )?;

    report(&progress, "Fusing pyramids...", 65.0);
    let fused_laplacians = fuse_laplacians(&pyramids.laplacians, &masks)?;
    let fused_top = fuse_top(&pyramids.tops, config.top_fusion)?;
    if let Some(sink) = sink {
        for (level, band) in fused_laplacians.iter().enumerate() {
            emit(sink.fused_laplacian(level, band), "fused Laplacian level");
        }
        emit(sink.fused_top(&fused_top), "fused top");
    }

    report(&progress, "Reconstructing...", 85.0);
    let fused = reconstruct(&fused_laplacians, &fused_top)?;
    if fused.size()? != stack.size()? {
        return Err(StackError::shape_mismatch(format!(
            "reconstruction is {}x{}, stack is {}x{}",
            fused.cols(),
            fused.rows(),
            stack.size()?.width,
            stack.size()?.height
        )));
    }

    log::info!("Fusion completed in {:?}", start.elapsed());
    report(&progress, "Fusion complete", 100.0);
    Ok(fused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiskCache;
    use crate::config::{ColorMode, MaskMode, TopFusion};
    use crate::image_io::write_image;
    use crate::opencv_compat;
    use crate::pyramid::tests::{max_abs_diff, textured};
    use crate::sharpness::laplacian_variance;
    use opencv::core::{self, Rect, Scalar};
    use opencv::imgproc;

    fn blurred(frame: &Mat, sigma: f64) -> Mat {
        let mut out = Mat::default();
        opencv_compat::gaussian_blur(frame, &mut out, 0, sigma).unwrap();
        out
    }

    fn region_mask(rows: i32, cols: i32, rect: Rect) -> Mat {
        let mut mask =
            Mat::new_rows_cols_with_default(rows, cols, core::CV_8U, Scalar::all(0.0)).unwrap();
        imgproc::rectangle(&mut mask, rect, Scalar::all(255.0), -1, imgproc::LINE_8, 0).unwrap();
        mask
    }

    fn shrink(rect: Rect, by: i32) -> Rect {
        Rect::new(rect.x + by, rect.y + by, rect.width - 2 * by, rect.height - 2 * by)
    }

    fn config(levels: usize, mask_mode: MaskMode, top_fusion: TopFusion) -> FusionConfig {
        FusionConfig {
            levels,
            mask_mode,
            top_fusion,
            ..FusionConfig::default()
        }
    }

    #[test]
    fn test_regions_in_focus_are_combined() -> Result<()> {
        let size = 256;
        let sharp = blurred(&textured(size, size, 3, 42), 0.8);
        let soft = blurred(&sharp, 3.0);
        let regions = [
            Rect::new(0, 0, 80, 80),
            Rect::new(88, 88, 80, 80),
            Rect::new(176, 176, 80, 80),
        ];

        let frames = regions
            .iter()
            .map(|&rect| {
                let mut frame = soft.clone();
                sharp.copy_to_masked(&mut frame, &region_mask(size, size, rect))?;
                Ok(frame)
            })
            .collect::<Result<Vec<_>>>()?;
        let stack = ImageStack::new(frames.clone())?;

        let fused = run_pipeline(&stack, &FusionConfig::production())?;
        assert_eq!(fused.size()?, core::Size::new(size, size));
        assert_eq!(fused.channels(), 3);

        for (i, &rect) in regions.iter().enumerate() {
            let mask = region_mask(size, size, shrink(rect, 8));
            let fused_var = laplacian_variance(&fused, Some(&mask))?;
            let sharp_var = laplacian_variance(&frames[i], Some(&mask))?;
            assert!(
                fused_var > 0.7 * sharp_var,
                "region {}: fused {} vs sharp {}",
                i,
                fused_var,
                sharp_var
            );
            for (j, frame) in frames.iter().enumerate().filter(|(j, _)| *j != i) {
                let blurry_var = laplacian_variance(frame, Some(&mask))?;
                assert!(fused_var > blurry_var, "region {} vs frame {}", i, j);
            }
        }

        let overall = laplacian_variance(&fused, None)?;
        for frame in &frames {
            assert!(overall > laplacian_variance(frame, None)?);
        }
        Ok(())
    }

    #[test]
    fn test_identical_frames_reproduce_input() -> Result<()> {
        let frame = blurred(&textured(61, 83, 3, 5), 1.0);
        let stack = ImageStack::new(vec![frame.clone(); 4])?;
        for mode in [MaskMode::Soft, MaskMode::Hard] {
            let fused = run_pipeline(&stack, &config(3, mode, TopFusion::Mean))?;
            assert!(max_abs_diff(&fused, &frame) < 1e-2, "{} mode", mode);
        }
        Ok(())
    }

    #[test]
    fn test_single_frame_is_identity() -> Result<()> {
        let frame = textured(48, 33, 3, 8);
        let stack = ImageStack::new(vec![frame.clone()])?;
        for mode in [MaskMode::Soft, MaskMode::Hard] {
            for top in [TopFusion::Mean, TopFusion::Max] {
                let fused = run_pipeline(&stack, &config(4, mode, top))?;
                assert!(max_abs_diff(&fused, &frame) < 1e-2, "{} / {}", mode, top);
            }
        }
        Ok(())
    }

    #[test]
    fn test_zero_levels_applies_top_reducer() -> Result<()> {
        let a = textured(20, 30, 3, 1);
        let b = textured(20, 30, 3, 2);
        let stack = ImageStack::new(vec![a.clone(), b.clone()])?;

        let mut expected_max = Mat::default();
        core::max(&a, &b, &mut expected_max)?;
        let fused = run_pipeline(&stack, &config(0, MaskMode::Soft, TopFusion::Max))?;
        assert!(max_abs_diff(&fused, &expected_max) < 1e-4);

        let mut expected_mean = Mat::default();
        core::add_weighted(&a, 0.5, &b, 0.5, 0.0, &mut expected_mean, -1)?;
        let fused = run_pipeline(&stack, &config(0, MaskMode::Hard, TopFusion::Mean))?;
        assert!(max_abs_diff(&fused, &expected_mean) < 1e-3);
        Ok(())
    }

    #[test]
    fn test_odd_sizes_keep_shape() -> Result<()> {
        let frames: Vec<Mat> = (0..3).map(|i| textured(37, 53, 1, i)).collect();
        let fused = run_pipeline(&ImageStack::new(frames)?, &FusionConfig::production())?;
        assert_eq!(fused.size()?, core::Size::new(53, 37));
        assert_eq!(fused.typ(), core::CV_32FC1);
        Ok(())
    }

    #[test]
    fn test_invalid_config_rejected_before_work() -> Result<()> {
        let stack = ImageStack::new(vec![textured(8, 8, 1, 1)])?;
        let bad = FusionConfig {
            smoothing_kernel_size: 4,
            ..FusionConfig::default()
        };
        assert!(matches!(run_pipeline(&stack, &bad), Err(StackError::InvalidConfig(_))));
        Ok(())
    }

    #[derive(Default)]
    struct CountingSink {
        calls: Mutex<Vec<&'static str>>,
    }

    impl DebugSink for CountingSink {
        fn gaussian_level(&self, _: usize, _: usize, _: &Mat) -> Result<()> {
            self.calls.lock().unwrap().push("gaussian");
            Ok(())
        }

        fn sharpness_map(&self, _: usize, _: usize, _: &Mat) -> Result<()> {
            self.calls.lock().unwrap().push("sharpness");
            Err(StackError::input("sink refuses"))
        }

        fn fused_top(&self, _: &Mat) -> Result<()> {
            self.calls.lock().unwrap().push("top");
            Ok(())
        }
    }

    #[test]
    fn test_sink_and_progress_are_observational() -> Result<()> {
        let frames: Vec<Mat> = (0..2).map(|i| textured(32, 32, 3, i)).collect();
        let stack = ImageStack::new(frames)?;
        let cfg = config(2, MaskMode::Soft, TopFusion::Max);

        let sink = CountingSink::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let progress: ProgressCallback = Arc::new(Mutex::new(move |msg: String, pct: f32| {
            recorder.lock().unwrap().push((msg, pct));
        }));

        let observed = run_pipeline_with(&stack, &cfg, Some(&sink), Some(progress))?;
        let plain = run_pipeline(&stack, &cfg)?;
        assert_eq!(max_abs_diff(&observed, &plain), 0.0);

        let calls = sink.calls.into_inner().unwrap();
        assert_eq!(calls.iter().filter(|c| **c == "gaussian").count(), 2 * 3);
        assert_eq!(calls.iter().filter(|c| **c == "sharpness").count(), 2 * 2);
        assert_eq!(calls.iter().filter(|c| **c == "top").count(), 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first().map(|(_, p)| *p), Some(0.0));
        assert_eq!(seen.last().map(|(_, p)| *p), Some(100.0));
        Ok(())
    }

    #[test]
    fn test_cache_key_covers_name_and_decoding() -> Result<()> {
        let root = tempfile::tempdir()?;
        let bee = root.path().join("bee");
        std::fs::create_dir_all(bee.join("sub"))?;

        let color = StackerSettings::default();
        let gray = StackerSettings {
            color_mode: ColorMode::Grayscale,
            ..StackerSettings::default()
        };
        assert_eq!(cache_key(&bee, &color), "bee_png_color_aligned");
        assert_eq!(cache_key(&bee.join("sub").join(".."), &color), cache_key(&bee, &color));
        assert_ne!(cache_key(&bee, &color), cache_key(&bee, &gray));
        assert_eq!(stack_name(&bee.join("sub").join("..")), "bee");
        Ok(())
    }

    #[test]
    fn test_preprocess_populates_and_reuses_cache() -> Result<()> {
        let root = tempfile::tempdir()?;
        let input = root.path().join("bee");
        let scene = blurred(&textured(64, 64, 3, 3), 2.0);
        write_image(&input.join("a.png"), &scene)?;
        write_image(&input.join("b.png"), &scene)?;

        let settings = StackerSettings::default();
        let cache = DiskCache::new(root.path().join("cache"));

        let first = preprocess_stack(&input, &settings, Some(&cache), None)?;
        assert_eq!(first.len(), 2);
        assert!(root.path().join("cache").join("bee_png_color_aligned").is_dir());

        // the source images are gone, so only the cache can satisfy this
        std::fs::remove_dir_all(&input)?;
        let second = preprocess_stack(&input, &settings, Some(&cache), None)?;
        assert_eq!(second.len(), 2);
        assert_eq!(max_abs_diff(&first.frames()[1], &second.frames()[1]), 0.0);
        Ok(())
    }

    #[test]
    fn test_preprocess_without_cache_or_images_fails() -> Result<()> {
        let root = tempfile::tempdir()?;
        let settings = StackerSettings::default();
        assert!(matches!(
            preprocess_stack(root.path(), &settings, None, None),
            Err(StackError::Input(_))
        ));
        Ok(())
    }
}
