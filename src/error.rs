//! Error types for construction, rendering and tree loading.

use crate::shader::{UniformKind, UniformLocation};
use std::path::PathBuf;

/// Failures that prevent a [`crate::Visualizer`] or GPU context from existing.
#[derive(Debug, thiserror::Error)]
pub enum VisualizerError {
    #[error("output size {width}x{height} has a zero dimension")]
    EmptyOutput { width: u32, height: u32 },

    #[error("output size {width}x{height} exceeds the GPU texture limit of {limit}")]
    ExceedsLimit { width: u32, height: u32, limit: u32 },

    #[error("failed to obtain GPU adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),

    #[error("failed to create GPU device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
}

/// Contract violations found while drawing a frame.
///
/// These indicate broken compiled data rather than bad user input, so they
/// abort the frame instead of being absorbed.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("uniform '{name}' of kind {kind} is bound to incompatible location {location:?}")]
    LocationMismatch {
        name: String,
        kind: UniformKind,
        location: UniformLocation,
    },
}

/// Failures while reading an authored tree file.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse layer tree: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("layer '{0}' needs exactly one of `source` or `path`")]
    MissingSource(String),
}
