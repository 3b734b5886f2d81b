//! Typed errors for the upscaling core.
//!
//! The orchestrator and its collaborators return [`UpscaleError`]; model
//! backends report [`BackendError`] so the orchestrator can decide which
//! fallback chain to advance. Application code wraps these in
//! `anyhow::Result` at call sites.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Terminal failure of one upscale request.
#[derive(Debug, thiserror::Error)]
pub enum UpscaleError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("all fallback candidates exhausted after {attempts} attempts (last error: {last_error})")]
    ResourcesExhausted { attempts: usize, last_error: String },

    #[error("inference failed on tile {tile}: {message}")]
    Inference { tile: usize, message: String },

    #[error("tile {tile} timed out after {timeout:?}")]
    TileTimeout { tile: usize, timeout: Duration },

    #[error("tile task failed: {0}")]
    TaskFailed(String),

    #[error("tile set incomplete, missing indices {missing:?}")]
    IncompleteTileSet { missing: Vec<usize> },

    #[error("composition failed: {0}")]
    Composition(String),

    #[error("upscale request cancelled")]
    Cancelled,
}

/// Stable classification of an [`UpscaleError`], used in responses and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    InvalidInput,
    ResourcesExhausted,
    Inference,
    IncompleteTileSet,
    Composition,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::InvalidInput => "invalid_input",
            Self::ResourcesExhausted => "resources_exhausted",
            Self::Inference => "inference",
            Self::IncompleteTileSet => "incomplete_tile_set",
            Self::Composition => "composition",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl UpscaleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Configuration(_) => FailureKind::Configuration,
            Self::InvalidInput(_) => FailureKind::InvalidInput,
            Self::ResourcesExhausted { .. } => FailureKind::ResourcesExhausted,
            Self::Inference { .. } | Self::TileTimeout { .. } | Self::TaskFailed(_) => {
                FailureKind::Inference
            }
            Self::IncompleteTileSet { .. } => FailureKind::IncompleteTileSet,
            Self::Composition(_) => FailureKind::Composition,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Classified failure reported by a [`crate::backend::ModelBackend`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The device ran out of memory. The orchestrator moves to the next device.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The model could not be loaded or is incompatible with the device.
    /// The orchestrator moves to the next model.
    #[error("model load failed: {0}")]
    LoadFailure(String),

    /// Any other failure. Not retried.
    #[error("inference failed: {0}")]
    InferenceFailure(String),
}
