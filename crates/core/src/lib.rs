//! Tiled super-resolution core: tile planning, overlap blending, device and
//! model fallback, the ONNX Runtime backend and the HTTP surface.

pub mod backend;
pub mod codec;
pub mod compositor;
pub mod config;
pub mod error;
pub mod events;
pub mod fallback;
pub mod image;
pub mod logging;
pub mod model_registry;
pub mod orchestrator;
pub mod planner;
pub mod runtime;
pub mod server;

pub use crate::backend::ModelBackend;
pub use crate::error::{BackendError, FailureKind, UpscaleError};
pub use crate::fallback::{Device, ModelId};
pub use crate::image::{Dimensions, Image, PixelFormat};
pub use crate::orchestrator::{
    UpscaleConfig, UpscaleOrchestrator, UpscaleOutcome, UpscaleRequest, UpscaledImage,
};
