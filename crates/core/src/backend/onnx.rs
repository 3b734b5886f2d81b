//! ONNX Runtime backend: CUDA / TensorRT / CPU execution providers.
//!
//! Supports FP32 models (e.g. Real-ESRGAN, value range 0-255) and FP16
//! models (e.g. AnimeJaNai, value range 0-1). Sessions are built lazily per
//! `(model, device)` and kept for the life of the backend.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{Array4, ArrayD, IxDyn};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, info, warn};

use super::ModelBackend;
use crate::error::BackendError;
use crate::fallback::{Device, ModelId};
use crate::image::{Image, PixelFormat};
use crate::model_registry::{ModelEntry, ModelRegistry};

/// Substrings ONNX Runtime and the CUDA/TensorRT providers use for
/// allocation failures.
const OOM_MARKERS: &[&str] = &[
    "out of memory",
    "cuda_error_out_of_memory",
    "cudaerrormemoryallocation",
    "failed to allocate",
    "bad_alloc",
    "cublas_status_alloc_failed",
];

struct LoadedModel {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    entry: ModelEntry,
}

pub struct OnnxBackend {
    registry: Arc<ModelRegistry>,
    trt_cache_dir: PathBuf,
    sessions: DashMap<(ModelId, Device), Arc<LoadedModel>>,
}

impl OnnxBackend {
    pub fn new(registry: Arc<ModelRegistry>, trt_cache_dir: PathBuf) -> Self {
        Self {
            registry,
            trt_cache_dir,
            sessions: DashMap::new(),
        }
    }

    pub fn loaded_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn session_for(&self, model: &ModelId, device: &Device) -> Result<Arc<LoadedModel>, BackendError> {
        let key = (model.clone(), *device);
        if let Some(loaded) = self.sessions.get(&key) {
            return Ok(Arc::clone(loaded.value()));
        }

        let entry = self.registry.get(model.as_str()).ok_or_else(|| {
            BackendError::LoadFailure(format!("model '{model}' is not in the registry"))
        })?;
        let path = self.registry.models_dir().join(&entry.filename);
        if !path.is_file() {
            return Err(BackendError::LoadFailure(format!(
                "model file not found: {}",
                path.display()
            )));
        }

        ensure_provider_available(device)?;

        let started = Instant::now();
        let session = build_session(&path, device, &self.trt_cache_dir)
            .map_err(|e| classify_error(&format!("{e:#}"), BackendError::LoadFailure))?;

        let input_name = session.inputs()[0].name().to_string();
        let output_name = session.outputs()[0].name().to_string();
        let is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        if is_fp16 != entry.is_fp16 {
            warn!(
                model = %model,
                catalog_fp16 = entry.is_fp16,
                detected_fp16 = is_fp16,
                "Model precision differs from catalog, using detected precision"
            );
        }

        info!(
            model = %model,
            device = %device,
            %input_name,
            %output_name,
            is_fp16,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Model session ready"
        );

        let loaded = Arc::new(LoadedModel {
            session: Mutex::new(session),
            input_name,
            output_name,
            is_fp16,
            entry: entry.clone(),
        });
        Ok(Arc::clone(self.sessions.entry(key).or_insert(loaded).value()))
    }
}

impl ModelBackend for OnnxBackend {
    fn infer(&self, tile: &Image, model: &ModelId, device: &Device) -> Result<Image, BackendError> {
        if tile.format() != PixelFormat::Rgb8 {
            return Err(BackendError::InferenceFailure(format!(
                "ONNX models take RGB tiles, got {:?}",
                tile.format()
            )));
        }
        let loaded = self.session_for(model, device)?;
        let entry = &loaded.entry;
        let align = entry.pad_align.max(1) as usize;
        let (h, w) = (tile.height() as usize, tile.width() as usize);
        let input = rgb_to_nchw_padded(tile, align, entry.normalization_range);
        let (padded_h, padded_w) = (input.shape()[2], input.shape()[3]);

        let output = {
            let mut session = loaded
                .session
                .lock()
                .map_err(|_| BackendError::InferenceFailure("session lock poisoned".into()))?;
            run_session(&mut session, &loaded, input)
                .map_err(|e| classify_error(&format!("{e:#}"), BackendError::InferenceFailure))?
        };

        let shape = output.shape();
        if shape.len() != 4 || shape[1] != 3 || shape[2] % padded_h != 0 {
            return Err(BackendError::InferenceFailure(format!(
                "unexpected output shape {shape:?} for input [1, 3, {padded_h}, {padded_w}]"
            )));
        }
        let scale = shape[2] / padded_h;
        if scale == 0 || shape[3] != padded_w * scale {
            return Err(BackendError::InferenceFailure(format!(
                "output shape {shape:?} is not a uniform upscale of [1, 3, {padded_h}, {padded_w}]"
            )));
        }
        if let Some(expected) = entry.scale {
            if expected as usize != scale {
                return Err(BackendError::InferenceFailure(format!(
                    "model '{model}' produced x{scale}, catalog says x{expected}"
                )));
            }
        }

        debug!(model = %model, device = %device, width = w, height = h, scale, "Tile inferred");
        nchw_to_rgb(&output, h * scale, w * scale, entry.normalization_range)
    }

    fn name(&self) -> &str {
        "onnx"
    }
}

fn run_session(session: &mut Session, loaded: &LoadedModel, input: Array4<f32>) -> Result<ArrayD<f32>> {
    let input_name = loaded.input_name.as_str();
    let output_name = loaded.output_name.as_str();
    if loaded.is_fp16 {
        let f32_slice = input
            .as_slice()
            .context("input tensor must be contiguous")?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);
        let fp16_array = ArrayD::from_shape_vec(IxDyn(input.shape()), fp16_data)?;
        let input_tensor = Tensor::from_array(fp16_array)?;
        let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
        let view = outputs[output_name].try_extract_array::<f16>()?;
        Ok(view.mapv(f32::from))
    } else {
        let input_tensor = Tensor::from_array(input)?;
        let outputs = session.run(ort::inputs![input_name => &input_tensor])?;
        let view = outputs[output_name].try_extract_array::<f32>()?;
        Ok(view.to_owned())
    }
}

/// Execution providers are checked up front so a machine without CUDA or
/// TensorRT moves on to the next device rather than the next model.
fn ensure_provider_available(device: &Device) -> Result<(), BackendError> {
    let available = match device {
        Device::Cpu => true,
        Device::Cuda(_) => CUDAExecutionProvider::default().is_available().unwrap_or(false),
        Device::Tensorrt(_) => {
            TensorRTExecutionProvider::default().is_available().unwrap_or(false)
                && CUDAExecutionProvider::default().is_available().unwrap_or(false)
        }
    };
    if available {
        Ok(())
    } else {
        Err(BackendError::OutOfMemory(format!(
            "execution provider for {device} is not available"
        )))
    }
}

fn build_session(model_path: &Path, device: &Device, trt_cache_dir: &Path) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match device {
        Device::Tensorrt(id) => {
            if let Err(e) = std::fs::create_dir_all(trt_cache_dir) {
                warn!(
                    dir = %trt_cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }
            info!(
                cache_dir = %trt_cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );
            let cache_path = trt_cache_dir.to_string_lossy().to_string();
            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(*id as i32)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(*id as i32)
                        .build(),
                ])?
                .commit_from_file(model_path)
        }
        Device::Cuda(id) => builder
            .with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(*id as i32)
                .build()
                .error_on_failure()])?
            .commit_from_file(model_path),
        Device::Cpu => builder.commit_from_file(model_path),
    }
    .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

    Ok(session)
}

/// Maps an ONNX Runtime error message to a backend error class; allocation
/// failures always become [`BackendError::OutOfMemory`].
fn classify_error(message: &str, otherwise: fn(String) -> BackendError) -> BackendError {
    let lower = message.to_ascii_lowercase();
    if OOM_MARKERS.iter().any(|marker| lower.contains(marker)) {
        BackendError::OutOfMemory(message.to_string())
    } else {
        otherwise(message.to_string())
    }
}

/// Mirror index for positions past the end of an axis of length `n`.
fn reflect(i: usize, n: usize) -> usize {
    if i < n {
        i
    } else {
        (n - 1).saturating_sub(i - n)
    }
}

/// Interleaved RGB u8 to NCHW `[1,3,H',W']` f32 in `range`, reflection-padded
/// so H' and W' are multiples of `align`.
fn rgb_to_nchw_padded(tile: &Image, align: usize, range: (f32, f32)) -> Array4<f32> {
    let (h, w) = (tile.height() as usize, tile.width() as usize);
    let padded_h = h.div_ceil(align) * align;
    let padded_w = w.div_ceil(align) * align;
    let (lo, hi) = range;
    let factor = (hi - lo) / 255.0;
    let data = tile.as_bytes();

    let mut nchw = Array4::<f32>::zeros((1, 3, padded_h, padded_w));
    for y in 0..padded_h {
        let src_y = reflect(y, h);
        for x in 0..padded_w {
            let src = (src_y * w + reflect(x, w)) * 3;
            for c in 0..3 {
                nchw[[0, c, y, x]] = f32::from(data[src + c]) * factor + lo;
            }
        }
    }
    nchw
}

/// NCHW output in `range` to interleaved RGB u8, cropped to `out_h x out_w`.
fn nchw_to_rgb(
    arr: &ArrayD<f32>,
    out_h: usize,
    out_w: usize,
    range: (f32, f32),
) -> Result<Image, BackendError> {
    let (lo, hi) = range;
    let factor = 255.0 / (hi - lo);
    let mut rgb = Vec::with_capacity(out_h * out_w * 3);
    for y in 0..out_h {
        for x in 0..out_w {
            for c in 0..3 {
                let v = (arr[[0, c, y, x]] - lo) * factor;
                rgb.push(v.round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    Image::new(rgb, out_w as u32, out_h as u32, PixelFormat::Rgb8)
        .map_err(|e| BackendError::InferenceFailure(e.to_string()))
}
