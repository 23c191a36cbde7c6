//! Multi-focus image stacking.
//!
//! A stack of frames of the same scene, each focused at a different depth,
//! is registered onto its first frame, decomposed into Laplacian pyramids and
//! fused level by level using per-pixel sharpness decisions. The result is a
//! single frame that is in focus wherever any input was.

pub mod alignment;
pub mod cache;
pub mod config;
pub mod debug;
pub mod error;
pub mod fusion;
pub mod image_io;
pub mod logger;
pub mod mask;
pub mod opencv_compat;
pub mod pipeline;
pub mod pyramid;
pub mod settings;
pub mod sharpness;
pub mod table;

pub use alignment::{align_stack, AlignmentOutcome};
pub use cache::{DiskCache, StackCache};
pub use config::{ColorMode, FusionConfig, MaskMode, StackerSettings, TopFusion};
pub use debug::{DebugSink, DirectorySink};
pub use error::{Result, StackError};
pub use image_io::ImageStack;
pub use pipeline::{preprocess_stack, run_pipeline, run_pipeline_with, ProgressCallback};
