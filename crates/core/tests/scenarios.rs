use std::sync::{Arc, Mutex};
use std::time::Duration;

use upscaler_core::events::UpscaleEvent;
use upscaler_core::{
    BackendError, Device, FailureKind, Image, ModelBackend, ModelId, PixelFormat, UpscaleConfig,
    UpscaleError, UpscaleOrchestrator, UpscaleRequest,
};

type FailureScript = dyn Fn(&ModelId, &Device) -> Option<BackendError> + Send + Sync;

/// Nearest-neighbour upscaler that records every call and fails on demand.
struct RecordingBackend {
    scale: u32,
    fail: Box<FailureScript>,
    calls: Mutex<Vec<(ModelId, Device, u32, u32)>>,
}

impl RecordingBackend {
    fn new(
        scale: u32,
        fail: impl Fn(&ModelId, &Device) -> Option<BackendError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            scale,
            fail: Box::new(fail),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(ModelId, Device, u32, u32)> {
        self.calls.lock().unwrap().clone()
    }
}

impl ModelBackend for RecordingBackend {
    fn infer(&self, tile: &Image, model: &ModelId, device: &Device) -> Result<Image, BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push((model.clone(), *device, tile.width(), tile.height()));
        if let Some(err) = (self.fail)(model, device) {
            return Err(err);
        }
        if self.scale == 1 {
            return Ok(tile.clone());
        }
        let s = self.scale;
        let mut data = Vec::with_capacity(tile.as_bytes().len() * (s * s) as usize);
        for y in 0..tile.height() * s {
            for x in 0..tile.width() * s {
                data.extend_from_slice(tile.row_span(x / s, y / s, 1));
            }
        }
        Image::new(data, tile.width() * s, tile.height() * s, tile.format())
            .map_err(|e| BackendError::InferenceFailure(e.to_string()))
    }
}

fn gradient(width: u32, height: u32) -> Image {
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for y in 0..height {
        for x in 0..width {
            data.push((x % 256) as u8);
            data.push((y % 256) as u8);
            data.push(((x * 7 + y * 13) % 256) as u8);
        }
    }
    Image::new(data, width, height, PixelFormat::Rgb8).unwrap()
}

fn chains(models: &[&str]) -> UpscaleConfig {
    UpscaleConfig {
        model_chain: models.iter().map(|m| ModelId::from(*m)).collect(),
        device_chain: vec![Device::Cuda(0), Device::Cpu],
        tile_timeout: Duration::from_secs(30),
        ..UpscaleConfig::default()
    }
}

#[tokio::test]
async fn identity_backend_round_trips_large_image_exactly() {
    let source = gradient(2048, 2048);
    let backend = RecordingBackend::new(1, |_, _| None);

    let result = UpscaleOrchestrator::new(backend.clone())
        .run(UpscaleRequest {
            source: source.clone(),
            config: chains(&["primary"]),
        })
        .await
        .unwrap();

    assert_eq!(result.tiles_processed, 25);
    assert_eq!(result.scale_factor, 1);
    assert_eq!(result.image, source);

    let calls = backend.calls();
    assert_eq!(calls.len(), 25);
    assert!(calls.iter().all(|c| c.2 <= 512 && c.3 <= 512));
    assert!(calls.iter().any(|c| c.2 == 128));
}

#[tokio::test]
async fn small_image_is_a_single_backend_call() {
    let backend = RecordingBackend::new(4, |_, _| None);

    let result = UpscaleOrchestrator::new(backend.clone())
        .run(UpscaleRequest {
            source: gradient(800, 600),
            config: chains(&["primary"]),
        })
        .await
        .unwrap();

    assert_eq!(backend.calls(), vec![(ModelId::from("primary"), Device::Cuda(0), 800, 600)]);
    assert_eq!((result.image.width(), result.image.height()), (3200, 2400));
    assert_eq!(result.tiles_processed, 1);
    assert_eq!(result.scale_factor, 4);
}

#[tokio::test]
async fn accelerator_oom_falls_back_to_cpu_with_primary_model() {
    let backend = RecordingBackend::new(2, |model, device| {
        (model.as_str() == "primary" && device.is_accelerator())
            .then(|| BackendError::OutOfMemory("CUDA out of memory".into()))
    });
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);

    let source = gradient(1500, 1200);
    let result = UpscaleOrchestrator::new(backend.clone())
        .with_observer(Arc::new(move |event: &UpscaleEvent| {
            sink.lock().unwrap().push(event.clone())
        }))
        .run(UpscaleRequest {
            source: source.clone(),
            config: chains(&["primary", "secondary"]),
        })
        .await
        .unwrap();

    assert_eq!(result.device_used, Device::Cpu);
    assert_eq!(result.model_used.as_str(), "primary");
    assert_eq!(result.image.dimensions(), source.dimensions().scaled(2).unwrap());

    let calls = backend.calls();
    assert_eq!(calls[0].1, Device::Cuda(0));
    assert!(calls[1..].iter().all(|c| c.1 == Device::Cpu && c.0.as_str() == "primary"));
    assert_eq!(calls.len(), result.tiles_processed + 1);

    let events = events.lock().unwrap();
    let advances = events
        .iter()
        .filter(|e| matches!(e, UpscaleEvent::FallbackAdvanced { .. }))
        .count();
    assert_eq!(advances, 1);
    assert!(matches!(
        events.last(),
        Some(UpscaleEvent::Finished {
            succeeded: true,
            failure: None,
            ..
        })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_tiles_match_sequential_output() {
    let source = gradient(1300, 1100);
    let oom_on_gpu = |_: &ModelId, device: &Device| {
        device
            .is_accelerator()
            .then(|| BackendError::OutOfMemory("allocation failed".into()))
    };

    let sequential = UpscaleOrchestrator::new(RecordingBackend::new(2, oom_on_gpu))
        .run(UpscaleRequest {
            source: source.clone(),
            config: chains(&["primary"]),
        })
        .await
        .unwrap();

    let mut parallel_config = chains(&["primary"]);
    parallel_config.max_in_flight_tiles = 4;
    let parallel = UpscaleOrchestrator::new(RecordingBackend::new(2, oom_on_gpu))
        .run(UpscaleRequest {
            source,
            config: parallel_config,
        })
        .await
        .unwrap();

    assert_eq!(parallel.image, sequential.image);
    assert_eq!(parallel.device_used, Device::Cpu);
}

#[tokio::test]
async fn every_model_failing_to_load_exhausts_resources() {
    let backend = RecordingBackend::new(2, |_, _| {
        Some(BackendError::LoadFailure("unsupported opset".into()))
    });
    let finished = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&finished);

    let err = UpscaleOrchestrator::new(backend.clone())
        .with_observer(Arc::new(move |event: &UpscaleEvent| {
            if let UpscaleEvent::Finished { succeeded, failure, .. } = event {
                *sink.lock().unwrap() = Some((*succeeded, *failure));
            }
        }))
        .run(UpscaleRequest {
            source: gradient(1500, 1500),
            config: chains(&["a", "b", "c"]),
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::ResourcesExhausted);
    match err {
        UpscaleError::ResourcesExhausted { attempts, last_error } => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("unsupported opset"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let models: Vec<_> = backend.calls().into_iter().map(|c| c.0).collect();
    assert_eq!(models, vec![ModelId::from("a"), ModelId::from("b"), ModelId::from("c")]);
    assert_eq!(
        *finished.lock().unwrap(),
        Some((false, Some(FailureKind::ResourcesExhausted)))
    );
}
