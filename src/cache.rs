//! Aligned-stack caching
//!
//! Aligned stacks are expensive to produce, so the driver can keep them on
//! disk keyed by input directory. Each entry is a directory holding a YAML
//! manifest plus one raw little-endian `f32` file per frame.

use anyhow::{bail, Context, Result};
use opencv::core::{self, Scalar};
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::image_io::ImageStack;

const MANIFEST_FILE: &str = "manifest.yml";

/// Key-value store for aligned stacks. The core never requires one.
pub trait StackCache: Sync {
    /// `Ok(None)` is a plain miss.
    fn load_cached(&self, key: &str) -> Result<Option<ImageStack>>;

    fn store(&self, key: &str, stack: &ImageStack) -> Result<()>;
}

/// Shape description written next to the frame data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub key: String,
    pub frame_count: usize,
    pub rows: i32,
    pub cols: i32,
    pub channels: i32,
    /// OpenCV element type, always a `CV_32F` variant
    pub frame_type: i32,
    pub created: String,
}

impl CacheManifest {
    fn for_stack(key: &str, stack: &ImageStack) -> Result<Self> {
        let size = stack.size()?;
        Ok(Self {
            key: key.to_string(),
            frame_count: stack.len(),
            rows: size.height,
            cols: size.width,
            channels: stack.channels(),
            frame_type: stack.reference().typ(),
            created: chrono::Local::now().to_rfc3339(),
        })
    }

    /// Byte length of one frame file, or `None` when the manifest describes
    /// no valid frame shape.
    fn frame_bytes(&self) -> Option<usize> {
        let expected_channels = match self.frame_type {
            t if t == core::CV_32FC1 => 1,
            t if t == core::CV_32FC3 => 3,
            _ => return None,
        };
        if self.rows <= 0 || self.cols <= 0 || self.channels != expected_channels {
            return None;
        }
        (self.rows as usize)
            .checked_mul(self.cols as usize)?
            .checked_mul(self.channels as usize)?
            .checked_mul(std::mem::size_of::<f32>())
    }

    pub fn save_to_file(&self, yaml_path: &Path) -> Result<()> {
        let yaml_content = serde_yaml::to_string(self)?;
        std::fs::write(yaml_path, yaml_content)?;
        Ok(())
    }

    pub fn load_from_file(yaml_path: &Path) -> Result<Self> {
        let yaml_content = std::fs::read_to_string(yaml_path)?;
        let manifest: CacheManifest = serde_yaml::from_str(&yaml_content)?;
        Ok(manifest)
    }
}

/// Filesystem-backed [`StackCache`].
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    fn frame_path(entry: &Path, index: usize) -> PathBuf {
        entry.join(format!("frame_{:03}.f32", index))
    }

    /// Remove a cached entry if present.
    pub fn invalidate(&self, key: &str) -> Result<()> {
        let entry = self.entry_dir(key);
        if entry.exists() {
            std::fs::remove_dir_all(&entry)
                .with_context(|| format!("removing cache entry {}", entry.display()))?;
        }
        Ok(())
    }
}

fn encode_frame(frame: &Mat) -> Result<Vec<u8>> {
    let owned;
    let frame = if frame.is_continuous() {
        frame
    } else {
        owned = frame.try_clone()?;
        &owned
    };
    let bytes = frame.data_bytes()?;
    let mut out = Vec::with_capacity(bytes.len());
    for chunk in bytes.chunks_exact(4) {
        let value = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(out)
}

fn decode_frame(manifest: &CacheManifest, raw: &[u8]) -> Result<Mat> {
    let mut frame = Mat::new_rows_cols_with_default(
        manifest.rows,
        manifest.cols,
        manifest.frame_type,
        Scalar::all(0.0),
    )?;
    let dst = frame.data_bytes_mut()?;
    if dst.len() != raw.len() {
        bail!("frame holds {} bytes, cache file has {}", dst.len(), raw.len());
    }
    for (out, chunk) in dst.chunks_exact_mut(4).zip(raw.chunks_exact(4)) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        out.copy_from_slice(&value.to_ne_bytes());
    }
    Ok(frame)
}

impl StackCache for DiskCache {
    fn load_cached(&self, key: &str) -> Result<Option<ImageStack>> {
        let entry = self.entry_dir(key);
        let manifest_path = entry.join(MANIFEST_FILE);
        if !manifest_path.exists() {
            return Ok(None);
        }

        let manifest = CacheManifest::load_from_file(&manifest_path)
            .with_context(|| format!("reading {}", manifest_path.display()))?;
        let frame_bytes = match manifest.frame_bytes() {
            Some(bytes) if manifest.key == key && manifest.frame_count > 0 => bytes,
            _ => {
                log::warn!(
                    "Cache manifest {} does not describe a valid stack for '{}'",
                    manifest_path.display(),
                    key
                );
                return Ok(None);
            }
        };

        let mut frames = Vec::with_capacity(manifest.frame_count);
        for index in 0..manifest.frame_count {
            let path = Self::frame_path(&entry, index);
            let raw = match std::fs::read(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("Cache frame {} unreadable: {}", path.display(), e);
                    return Ok(None);
                }
            };
            if raw.len() != frame_bytes {
                log::warn!(
                    "Cache frame {} has {} bytes, manifest expects {}",
                    path.display(),
                    raw.len(),
                    frame_bytes
                );
                return Ok(None);
            }
            frames.push(decode_frame(&manifest, &raw)?);
        }

        log::info!(
            "Loaded {} cached frames for '{}' (created {})",
            manifest.frame_count,
            key,
            manifest.created
        );
        Ok(Some(ImageStack::new(frames)?))
    }

    fn store(&self, key: &str, stack: &ImageStack) -> Result<()> {
        let entry = self.entry_dir(key);
        self.invalidate(key)?;
        std::fs::create_dir_all(&entry)
            .with_context(|| format!("creating cache entry {}", entry.display()))?;

        for (index, frame) in stack.frames().iter().enumerate() {
            let path = Self::frame_path(&entry, index);
            std::fs::write(&path, encode_frame(frame)?)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        // manifest last, so a partially written entry reads as a miss
        CacheManifest::for_stack(key, stack)?.save_to_file(&entry.join(MANIFEST_FILE))?;

        log::info!("Cached {} frames under {}", stack.len(), entry.display());
        Ok(())
    }
}
