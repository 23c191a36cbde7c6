use opencv::prelude::*;
use opencv::{core, imgcodecs, imgproc};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

use crate::config::ColorMode;
use crate::error::{Result, StackError};
use crate::opencv_compat;

/// Ordered, non-empty sequence of equally shaped `CV_32F` frames.
///
/// Index 0 is the alignment reference. The order is the enumeration order the
/// frames were loaded in and is never changed afterwards.
#[derive(Debug, Clone)]
pub struct ImageStack {
    frames: Vec<Mat>,
}

impl ImageStack {
    pub fn new(frames: Vec<Mat>) -> Result<Self> {
        let first = frames
            .first()
            .ok_or_else(|| StackError::input("image stack is empty"))?;
        if first.depth() != core::CV_32F {
            return Err(StackError::input(format!(
                "frames must be 32-bit float, frame 0 has OpenCV type {}",
                first.typ()
            )));
        }
        let size = first.size()?;
        let typ = first.typ();
        for (idx, frame) in frames.iter().enumerate().skip(1) {
            if frame.size()? != size || frame.typ() != typ {
                return Err(StackError::shape_mismatch(format!(
                    "frame {} is {}x{} with {} channels, reference is {}x{} with {} channels",
                    idx,
                    frame.cols(),
                    frame.rows(),
                    frame.channels(),
                    size.width,
                    size.height,
                    first.channels()
                )));
            }
        }
        Ok(Self { frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Mat] {
        &self.frames
    }

    pub fn reference(&self) -> &Mat {
        &self.frames[0]
    }

    pub fn size(&self) -> Result<core::Size> {
        Ok(self.reference().size()?)
    }

    pub fn channels(&self) -> i32 {
        self.reference().channels()
    }

    pub fn into_frames(self) -> Vec<Mat> {
        self.frames
    }
}

/// Load an image from disk as a `CV_32F` frame with timing and logging.
pub fn load_image(path: &Path, color_mode: ColorMode) -> Result<Mat> {
    let start = std::time::Instant::now();
    let filename = path.file_name().unwrap_or_default().to_string_lossy();

    let path_str = path
        .to_str()
        .ok_or_else(|| StackError::input(format!("non UTF-8 path: {}", path.display())))?;
    let flags = match color_mode {
        ColorMode::Color => imgcodecs::IMREAD_COLOR,
        ColorMode::Grayscale => imgcodecs::IMREAD_GRAYSCALE,
    };
    let img = imgcodecs::imread(path_str, flags)?;
    if img.empty() {
        return Err(StackError::input(format!("failed to decode {}", path.display())));
    }

    let mut frame = Mat::default();
    img.convert_to(&mut frame, core::CV_32F, 1.0, 0.0)?;

    log::info!(
        "Loaded {} in {:?} - Size: {}x{}, Channels: {}",
        filename,
        start.elapsed(),
        frame.cols(),
        frame.rows(),
        frame.channels()
    );
    Ok(frame)
}

/// Single-channel intensity view of a frame (luma for BGR input).
pub fn to_intensity(frame: &Mat) -> Result<Mat> {
    match frame.channels() {
        1 => Ok(frame.clone()),
        3 => {
            let mut gray = Mat::default();
            opencv_compat::cvt_color(frame, &mut gray, imgproc::COLOR_BGR2GRAY)?;
            Ok(gray)
        }
        4 => {
            let mut gray = Mat::default();
            opencv_compat::cvt_color(frame, &mut gray, imgproc::COLOR_BGRA2GRAY)?;
            Ok(gray)
        }
        n => Err(StackError::shape_mismatch(format!("unsupported channel count {}", n))),
    }
}

/// Files in `dir` with the given extension (case-insensitive), sorted by name.
pub fn list_stack_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(StackError::input(format!("{} is not a directory", dir.display())));
    }
    let wanted = extension.trim_start_matches('.').to_ascii_lowercase();
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path.is_file()
            && path
                .extension()
                .map_or(false, |ext| ext.to_string_lossy().to_ascii_lowercase() == wanted);
        if matches {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Load every matching file of `dir` in lexicographic order.
pub fn load_stack(dir: &Path, extension: &str, color_mode: ColorMode) -> Result<Vec<Mat>> {
    let paths = list_stack_files(dir, extension)?;
    if paths.is_empty() {
        return Err(StackError::input(format!(
            "no images found in {} with extension .{}",
            dir.display(),
            extension.trim_start_matches('.')
        )));
    }
    log::info!("Loading {} images from {}", paths.len(), dir.display());

    // collect() on an indexed parallel iterator keeps the input order
    paths
        .par_iter()
        .map(|path| load_image(path, color_mode))
        .collect()
}

/// Resize every frame that differs from the first one to the first frame's
/// size (nearest neighbour). Channel counts cannot be reconciled this way.
pub fn ensure_same_size(frames: Vec<Mat>) -> Result<ImageStack> {
    let Some(first) = frames.first() else {
        return Err(StackError::input("image stack is empty"));
    };
    let target = first.size()?;
    let channels = first.channels();

    let mut resized = Vec::with_capacity(frames.len());
    for (idx, frame) in frames.into_iter().enumerate() {
        if frame.channels() != channels {
            return Err(StackError::shape_mismatch(format!(
                "frame {} has {} channels, reference has {}",
                idx,
                frame.channels(),
                channels
            )));
        }
        if frame.size()? == target {
            resized.push(frame);
            continue;
        }
        log::warn!(
            "Frame {} is {}x{}, resizing to {}x{}",
            idx,
            frame.cols(),
            frame.rows(),
            target.width,
            target.height
        );
        let mut out = Mat::default();
        imgproc::resize(&frame, &mut out, target, 0.0, 0.0, imgproc::INTER_NEAREST)?;
        resized.push(out);
    }
    ImageStack::new(resized)
}

/// Clip a float frame to [0, 255] and write it as an 8-bit image.
pub fn write_image(path: &Path, frame: &Mat) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let path_str = path
        .to_str()
        .ok_or_else(|| StackError::input(format!("non UTF-8 path: {}", path.display())))?;

    // convert_to saturates to the 8-bit range
    let mut out = Mat::default();
    frame.convert_to(&mut out, core::CV_8U, 1.0, 0.0)?;
    if !imgcodecs::imwrite(path_str, &out, &core::Vector::new())? {
        return Err(StackError::input(format!("failed to encode {}", path.display())));
    }
    Ok(())
}
