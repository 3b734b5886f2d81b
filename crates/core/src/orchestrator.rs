//! Request-level control: plan tiles, run each through the backend under the
//! fallback policy, blend, and report one terminal outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::ModelBackend;
use crate::codec::OutputFormat;
use crate::compositor::{self, TileResult};
use crate::error::{BackendError, UpscaleError};
use crate::events::{self, FallbackReason, UpscaleEvent, UpscaleEventObserver};
use crate::fallback::{Candidate, Device, FallbackPolicy, ModelId};
use crate::image::Image;
use crate::planner::{self, TilePlan};

pub const DEFAULT_MAX_IMAGE_SIZE: u32 = 1024;
pub const DEFAULT_TILE_SIZE: u32 = 512;
pub const DEFAULT_TILE_OVERLAP: u32 = 32;
pub const DEFAULT_TILE_TIMEOUT: Duration = Duration::from_secs(300);

/// Immutable settings for one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpscaleConfig {
    pub max_image_size: u32,
    pub tile_size: u32,
    pub tile_overlap: u32,
    pub model_chain: Vec<ModelId>,
    pub device_chain: Vec<Device>,
    pub output_format: OutputFormat,
    pub output_quality: u8,
    pub tile_timeout: Duration,
    /// 1 processes tiles strictly one after another.
    pub max_in_flight_tiles: usize,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            tile_size: DEFAULT_TILE_SIZE,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            model_chain: vec![ModelId::from("RealESRGAN_x4plus_anime_6B")],
            device_chain: vec![Device::Cuda(0), Device::Cpu],
            output_format: OutputFormat::Jpeg,
            output_quality: 95,
            tile_timeout: DEFAULT_TILE_TIMEOUT,
            max_in_flight_tiles: 1,
        }
    }
}

impl UpscaleConfig {
    pub fn validate(&self) -> Result<(), UpscaleError> {
        planner::validate(self.max_image_size, self.tile_size, self.tile_overlap)?;
        if self.model_chain.is_empty() {
            return Err(UpscaleError::Configuration("model chain is empty".into()));
        }
        if self.device_chain.is_empty() {
            return Err(UpscaleError::Configuration("device chain is empty".into()));
        }
        if self.max_in_flight_tiles == 0 {
            return Err(UpscaleError::Configuration(
                "max_in_flight_tiles must be at least 1".into(),
            ));
        }
        if self.tile_timeout.is_zero() {
            return Err(UpscaleError::Configuration(
                "tile_timeout must be positive".into(),
            ));
        }
        if !(1..=100).contains(&self.output_quality) {
            return Err(UpscaleError::Configuration(format!(
                "output_quality must be within 1..=100, got {}",
                self.output_quality
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct UpscaleRequest {
    pub source: Image,
    pub config: UpscaleConfig,
}

/// A successfully composed image and the candidate that produced it.
#[derive(Debug, Clone)]
pub struct UpscaledImage {
    pub image: Image,
    pub model_used: ModelId,
    pub device_used: Device,
    pub tiles_processed: usize,
    pub scale_factor: u32,
    /// Backend calls made, including failed ones.
    pub attempts: usize,
}

pub type UpscaleOutcome = Result<UpscaledImage, UpscaleError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Planning,
    TilingInProgress,
    Blending,
    Succeeded,
    Failed,
}

/// Shared by every tile task of one request.
struct TileContext {
    backend: Arc<dyn ModelBackend>,
    policy: Mutex<FallbackPolicy>,
    cancel: CancellationToken,
    observer: Option<Arc<UpscaleEventObserver>>,
    tile_timeout: Duration,
    attempts: AtomicUsize,
    device_permit: Option<Arc<OwnedSemaphorePermit>>,
}

/// Single-use controller for one upscale request.
pub struct UpscaleOrchestrator {
    backend: Arc<dyn ModelBackend>,
    cancel: CancellationToken,
    observer: Option<Arc<UpscaleEventObserver>>,
    state: OrchestratorState,
    request_id: Uuid,
    device_permit: Option<Arc<OwnedSemaphorePermit>>,
}

impl UpscaleOrchestrator {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            cancel: CancellationToken::new(),
            observer: None,
            state: OrchestratorState::Planning,
            request_id: Uuid::new_v4(),
            device_permit: None,
        }
    }

    /// Cancelling `token` fails the request with [`UpscaleError::Cancelled`].
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_observer(mut self, observer: Arc<UpscaleEventObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    /// Holds `permit` until the request finishes and every backend call it
    /// started has returned, including calls abandoned after a timeout or
    /// cancellation.
    pub fn with_device_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.device_permit = Some(Arc::new(permit));
        self
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub async fn run(mut self, request: UpscaleRequest) -> UpscaleOutcome {
        let span = info_span!("upscale", request_id = %self.request_id);
        async move {
            let started = Instant::now();
            info!(
                width = request.source.width(),
                height = request.source.height(),
                models = request.config.model_chain.len(),
                devices = request.config.device_chain.len(),
                backend = self.backend.name(),
                "Upscale request started"
            );

            let outcome = self.execute(request).await;
            let (next, tiles_processed) = match &outcome {
                Ok(result) => (OrchestratorState::Succeeded, result.tiles_processed),
                Err(_) => (OrchestratorState::Failed, 0),
            };
            self.transition(next);
            if let Err(error) = &outcome {
                warn!(kind = %error.kind(), error = %error, "Upscale request failed");
            }
            events::emit(
                self.observer.as_ref(),
                UpscaleEvent::Finished {
                    succeeded: outcome.is_ok(),
                    failure: outcome.as_ref().err().map(UpscaleError::kind),
                    tiles_processed,
                    elapsed_ms: events::millis(started.elapsed()),
                },
            );
            outcome
        }
        .instrument(span)
        .await
    }

    fn transition(&mut self, next: OrchestratorState) {
        let from = std::mem::replace(&mut self.state, next);
        events::emit(
            self.observer.as_ref(),
            UpscaleEvent::StateChanged { from, to: next },
        );
    }

    async fn execute(&mut self, request: UpscaleRequest) -> UpscaleOutcome {
        let UpscaleRequest { source, config } = request;
        config.validate()?;
        let plan = planner::plan(
            source.dimensions(),
            config.max_image_size,
            config.tile_size,
            config.tile_overlap,
        )?;
        let policy = FallbackPolicy::new(config.model_chain.clone(), config.device_chain.clone())?;
        events::emit(
            self.observer.as_ref(),
            UpscaleEvent::Planned {
                tiles: plan.len(),
                columns: plan.columns.len(),
                rows: plan.rows.len(),
            },
        );

        self.transition(OrchestratorState::TilingInProgress);
        let ctx = Arc::new(TileContext {
            backend: Arc::clone(&self.backend),
            policy: Mutex::new(policy),
            cancel: self.cancel.child_token(),
            observer: self.observer.clone(),
            tile_timeout: config.tile_timeout,
            attempts: AtomicUsize::new(0),
            device_permit: self.device_permit.clone(),
        });
        let source = Arc::new(source);
        let results = process_tiles(&plan, &source, &ctx, config.max_in_flight_tiles).await?;
        drop(source);

        self.transition(OrchestratorState::Blending);
        let scale_factor = results
            .first()
            .map(|r| r.scale_factor)
            .ok_or_else(|| UpscaleError::IncompleteTileSet {
                missing: (0..plan.len()).collect(),
            })?;
        let tiles_processed = results.len();
        let output = plan.source.scaled(scale_factor).ok_or_else(|| {
            UpscaleError::Composition(format!(
                "source {}x{} at x{scale_factor} overflows the output size",
                plan.source.width, plan.source.height
            ))
        })?;
        let image = tokio::task::spawn_blocking(move || {
            compositor::blend(results, &plan, output, scale_factor)
        })
        .await
        .map_err(|e| UpscaleError::Composition(format!("blend task failed: {e}")))??;

        let final_candidate = ctx.policy.lock().await.current();
        Ok(UpscaledImage {
            image,
            model_used: final_candidate.model,
            device_used: final_candidate.device,
            tiles_processed,
            scale_factor,
            attempts: ctx.attempts.load(Ordering::Relaxed),
        })
    }
}

/// Runs every tile of `plan`, at most `limit` at a time. Tiles are extracted
/// only when a slot frees up.
async fn process_tiles(
    plan: &TilePlan,
    source: &Arc<Image>,
    ctx: &Arc<TileContext>,
    limit: usize,
) -> Result<Vec<TileResult>, UpscaleError> {
    let mut tasks: JoinSet<Result<TileResult, UpscaleError>> = JoinSet::new();
    let mut results = Vec::with_capacity(plan.len());

    let outcome: Result<(), UpscaleError> = async {
        for spec in &plan.tiles {
            while tasks.len() >= limit {
                collect_next(&mut tasks, &mut results).await?;
            }
            if ctx.cancel.is_cancelled() {
                return Err(UpscaleError::Cancelled);
            }
            let tile = compositor::extract(source, spec);
            let ctx = Arc::clone(ctx);
            let index = spec.index;
            tasks.spawn(process_tile(ctx, index, tile).in_current_span());
        }
        while !tasks.is_empty() {
            collect_next(&mut tasks, &mut results).await?;
        }
        Ok(())
    }
    .await;

    if let Err(error) = outcome {
        ctx.cancel.cancel();
        tasks.abort_all();
        return Err(error);
    }
    Ok(results)
}

async fn collect_next(
    tasks: &mut JoinSet<Result<TileResult, UpscaleError>>,
    results: &mut Vec<TileResult>,
) -> Result<(), UpscaleError> {
    match tasks.join_next().await {
        Some(Ok(Ok(result))) => {
            results.push(result);
            Ok(())
        }
        Some(Ok(Err(error))) => Err(error),
        Some(Err(join_error)) if join_error.is_cancelled() => Err(UpscaleError::Cancelled),
        Some(Err(join_error)) => Err(UpscaleError::TaskFailed(join_error.to_string())),
        None => Ok(()),
    }
}

/// Runs one tile until it succeeds or the fallback policy gives up.
///
/// Each retry uses a strictly later candidate, so a tile makes at most
/// `models x devices` backend calls.
async fn process_tile(ctx: Arc<TileContext>, index: usize, tile: Image) -> Result<TileResult, UpscaleError> {
    let tile = Arc::new(tile);
    let mut attempt = 0;
    loop {
        let candidate = ctx.policy.lock().await.current();
        attempt += 1;
        ctx.attempts.fetch_add(1, Ordering::Relaxed);
        events::emit(
            ctx.observer.as_ref(),
            UpscaleEvent::TileStarted {
                index,
                model: candidate.model.clone(),
                device: candidate.device,
                attempt,
            },
        );

        let started = Instant::now();
        let error = match infer_with_deadline(&ctx, index, &tile, &candidate).await? {
            Ok(image) => {
                let scale_factor = output_scale(index, &tile, &image)?;
                events::emit(
                    ctx.observer.as_ref(),
                    UpscaleEvent::TileCompleted {
                        index,
                        model: candidate.model,
                        device: candidate.device,
                        elapsed_ms: events::millis(started.elapsed()),
                    },
                );
                return Ok(TileResult {
                    index,
                    image,
                    scale_factor,
                });
            }
            Err(error) => error,
        };

        let reason = match &error {
            BackendError::OutOfMemory(_) => FallbackReason::OutOfMemory,
            BackendError::LoadFailure(_) => FallbackReason::LoadFailure,
            BackendError::InferenceFailure(message) => {
                return Err(UpscaleError::Inference {
                    tile: index,
                    message: message.clone(),
                });
            }
        };

        let mut policy = ctx.policy.lock().await;
        if policy.generation() != candidate.generation {
            debug!(
                tile = index,
                error = %error,
                "Candidate already replaced by another tile, retrying"
            );
            continue;
        }
        let advanced = match reason {
            FallbackReason::OutOfMemory => policy.advance_device(),
            FallbackReason::LoadFailure => policy.advance_model(),
        };
        drop(policy);
        let next = advanced.map_err(|_| UpscaleError::ResourcesExhausted {
            attempts: ctx.attempts.load(Ordering::Relaxed),
            last_error: error.to_string(),
        })?;
        events::emit(
            ctx.observer.as_ref(),
            UpscaleEvent::FallbackAdvanced {
                tile: index,
                reason,
                from_model: candidate.model,
                from_device: candidate.device,
                to_model: next.model,
                to_device: next.device,
            },
        );
    }
}

/// One backend call on the blocking pool, bounded by the tile timeout and
/// the request's cancellation token. The outer error is terminal; the inner
/// one is the backend's classified failure.
async fn infer_with_deadline(
    ctx: &TileContext,
    index: usize,
    tile: &Arc<Image>,
    candidate: &Candidate,
) -> Result<Result<Image, BackendError>, UpscaleError> {
    let backend = Arc::clone(&ctx.backend);
    let input = Arc::clone(tile);
    let model = candidate.model.clone();
    let device = candidate.device;
    let permit = ctx.device_permit.clone();
    let call = tokio::task::spawn_blocking(move || {
        let result = backend.infer(&input, &model, &device);
        drop(permit);
        result
    });

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(UpscaleError::Cancelled),
        joined = tokio::time::timeout(ctx.tile_timeout, call) => match joined {
            Err(_) => Err(UpscaleError::TileTimeout {
                tile: index,
                timeout: ctx.tile_timeout,
            }),
            Ok(Err(join_error)) => Err(UpscaleError::Inference {
                tile: index,
                message: format!("backend task failed: {join_error}"),
            }),
            Ok(Ok(result)) => Ok(result),
        },
    }
}

/// The backend must return the same pixel format, scaled by one integer
/// factor on both axes.
fn output_scale(index: usize, tile: &Image, output: &Image) -> Result<u32, UpscaleError> {
    let invalid = |detail: String| UpscaleError::Inference {
        tile: index,
        message: detail,
    };
    if output.format() != tile.format() {
        return Err(invalid(format!(
            "backend returned {:?} for a {:?} tile",
            output.format(),
            tile.format()
        )));
    }
    let (w, h) = (tile.width(), tile.height());
    let sx = output.width() / w;
    let sy = output.height() / h;
    if sx == 0 || sx != sy || output.width() != w * sx || output.height() != h * sy {
        return Err(invalid(format!(
            "backend returned {}x{} for a {w}x{h} tile, not an integer upscale",
            output.width(),
            output.height()
        )));
    }
    Ok(sx)
}
