//! Model backends: anything that can upscale one tile with a named model on a
//! given device.

pub mod onnx;

use crate::error::BackendError;
use crate::fallback::{Device, ModelId};
use crate::image::Image;

pub use onnx::OnnxBackend;

/// Upscales single tiles. Implementations block for the duration of
/// inference and are called from the blocking thread pool.
///
/// Failures must be classified: [`BackendError::OutOfMemory`] moves the
/// request to the next device, [`BackendError::LoadFailure`] to the next
/// model, and [`BackendError::InferenceFailure`] fails the request.
pub trait ModelBackend: Send + Sync {
    fn infer(&self, tile: &Image, model: &ModelId, device: &Device) -> Result<Image, BackendError>;

    fn name(&self) -> &str {
        "backend"
    }
}
