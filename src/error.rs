//! Error types for the stacking core.
//!
//! Only stack-level failures live here. Per-frame alignment problems are
//! recovered inside the aligner and surface as [`crate::alignment::AlignmentOutcome`]
//! values instead.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StackError {
    /// Empty stack, missing directory or an undecodable file.
    #[error("input error: {0}")]
    Input(String),

    /// Frames or per-image pyramids whose shapes cannot be reconciled.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("opencv: {0}")]
    OpenCv(#[from] opencv::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StackError>;

impl StackError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
