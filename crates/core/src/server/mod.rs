use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::{ModelBackend, OnnxBackend};
use crate::codec::{self, CodecError, OutputFormat};
use crate::config::AppConfig;
use crate::error::{FailureKind, UpscaleError};
use crate::model_registry::{ModelEntry, ModelRegistry};
use crate::orchestrator::{UpscaleConfig, UpscaleOrchestrator, UpscaleRequest};

/// Multipart framing allowance on top of the configured upload limit.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

const HEADER_MODEL: HeaderName = HeaderName::from_static("x-upscale-model");
const HEADER_DEVICE: HeaderName = HeaderName::from_static("x-upscale-device");
const HEADER_TILES: HeaderName = HeaderName::from_static("x-upscale-tiles");
const HEADER_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    upscale: UpscaleConfig,
    backend: Arc<dyn ModelBackend>,
    model_registry: Arc<ModelRegistry>,
    request_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        model_registry: Arc<ModelRegistry>,
        backend: Arc<dyn ModelBackend>,
    ) -> Result<Self> {
        let upscale = config.upscale_config()?;
        let slots = config.server.max_concurrent_requests.max(1);

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                upscale,
                backend,
                model_registry,
                request_slots: Arc::new(Semaphore::new(slots)),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Cancelling this token fails every in-flight upscale with `Cancelled`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }
}

/// Builds state backed by ONNX Runtime, with the model catalog rooted at the
/// configured models directory. `config` paths must already be resolved.
pub fn app_state_with_config(config: AppConfig) -> Result<AppState> {
    let registry = Arc::new(ModelRegistry::load(config.paths.models_dir.clone()));
    let backend = Arc::new(OnnxBackend::new(
        Arc::clone(&registry),
        config.paths.trt_cache_dir.clone(),
    ));
    AppState::new(config, registry, backend)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

#[derive(Serialize)]
pub struct ModelListing {
    #[serde(flatten)]
    pub entry: ModelEntry,
    pub downloaded: bool,
}

pub fn app_router(state: AppState) -> Router {
    let body_limit = state
        .inner
        .config
        .server
        .max_upload_bytes()
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config))
        .route("/api/models", get(list_models))
        .route("/api/upscale", post(upscale))
        .route("/upscale", post(upscale))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    Json(state.inner.config.clone())
}

async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelListing>> {
    let registry = &state.inner.model_registry;
    let models = registry
        .list()
        .iter()
        .map(|entry| ModelListing {
            downloaded: registry.is_downloaded(&entry.name),
            entry: entry.clone(),
        })
        .collect();
    Json(models)
}

struct Upload {
    stem: String,
    bytes: Bytes,
}

async fn upscale(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let request_id = Uuid::new_v4();
    let limit = state.inner.config.server.max_upload_bytes();
    let Upload { stem, bytes } = read_upload(multipart, limit).await?;
    codec::sniff_format(&bytes)?;
    info!(
        %request_id,
        file = %stem,
        bytes = bytes.len(),
        "Upscale request received"
    );

    // Decoded sources only exist while a request slot is held.
    let permit = Arc::clone(&state.inner.request_slots)
        .acquire_owned()
        .await
        .map_err(|_| AppError::Internal("server is shutting down".to_string()))?;

    let source = tokio::task::spawn_blocking(move || codec::decode(&bytes))
        .await
        .map_err(|e| AppError::Internal(format!("decode task failed: {e}")))?
        .map_err(AppError::from)?;

    let upscaled = UpscaleOrchestrator::new(Arc::clone(&state.inner.backend))
        .with_cancellation(state.inner.shutdown.child_token())
        .with_request_id(request_id)
        .with_device_permit(permit)
        .run(UpscaleRequest {
            source,
            config: state.inner.upscale.clone(),
        })
        .await?;

    let format = state.inner.upscale.output_format;
    let quality = state.inner.upscale.output_quality;
    let image = upscaled.image;
    let encoded = tokio::task::spawn_blocking(move || codec::encode(&image, format, quality))
        .await
        .map_err(|e| AppError::Internal(format!("encode task failed: {e}")))?
        .map_err(|e| AppError::Internal(e.to_string()))?;

    let filename = format!("upscaled_{stem}.{}", format.extension());
    if let Some(dir) = state.inner.config.paths.output_dir.as_deref() {
        persist_result(dir, &request_id, &filename, &encoded).await;
    }

    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static(format.mime())),
        (
            header::CONTENT_DISPOSITION,
            header_value(&format!("attachment; filename=\"{filename}\""))?,
        ),
        (HEADER_MODEL, header_value(upscaled.model_used.as_str())?),
        (HEADER_DEVICE, header_value(&upscaled.device_used.to_string())?),
        (HEADER_TILES, header_value(&upscaled.tiles_processed.to_string())?),
        (HEADER_REQUEST_ID, header_value(&request_id.to_string())?),
    ];
    Ok((StatusCode::OK, headers, encoded).into_response())
}

/// Takes the first file field of the form. Declared content types must name
/// an image; the container itself is checked again when decoding.
async fn read_upload(mut multipart: Multipart, limit: usize) -> Result<Upload, AppError> {
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.file_name().is_none() && field.name() != Some("file") {
            continue;
        }

        if let Some(content_type) = field.content_type() {
            if !codec::is_accepted_content_type(content_type) {
                return Err(AppError::BadRequest(format!(
                    "unsupported content type: {content_type}"
                )));
            }
        }

        let stem = field
            .file_name()
            .map(file_stem)
            .unwrap_or_else(|| "image".to_string());
        let bytes = field.bytes().await.map_err(multipart_error)?;
        if bytes.len() > limit {
            return Err(AppError::PayloadTooLarge(format!(
                "upload exceeds the {} MB limit",
                limit / (1024 * 1024)
            )));
        }
        if bytes.is_empty() {
            return Err(AppError::BadRequest("uploaded file is empty".to_string()));
        }
        return Ok(Upload { stem, bytes });
    }

    Err(AppError::BadRequest(
        "multipart form has no file field".to_string(),
    ))
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(err.body_text())
    } else {
        AppError::BadRequest(err.body_text())
    }
}

/// File stem safe to embed in a header value.
fn file_stem(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value).map_err(|e| AppError::Internal(format!("invalid header: {e}")))
}

async fn persist_result(dir: &StdPath, request_id: &Uuid, filename: &str, bytes: &[u8]) {
    let path: PathBuf = dir.join(format!("{}_{filename}", request_id.simple()));
    let written = async {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create output directory: {}", dir.display()))?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write result: {}", path.display()))
    }
    .await;

    match written {
        Ok(()) => info!(%request_id, path = %path.display(), "Result saved"),
        Err(err) => warn!(%request_id, error = %format!("{err:#}"), "Failed to save result"),
    }
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    PayloadTooLarge(String),
    Internal(String),
    Upscale(UpscaleError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, kind) = match self {
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, msg, Some(FailureKind::InvalidInput))
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::PayloadTooLarge(msg) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                msg,
                Some(FailureKind::InvalidInput),
            ),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
            AppError::Upscale(err) => {
                let kind = err.kind();
                let status = match kind {
                    FailureKind::InvalidInput => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.to_string(), Some(kind))
            }
        };

        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %error, "Request failed");
        }
        (status, Json(ErrorResponse { error, kind })).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{err:#}"))
    }
}

impl From<UpscaleError> for AppError {
    fn from(err: UpscaleError) -> Self {
        AppError::Upscale(err)
    }
}

impl From<CodecError> for AppError {
    fn from(err: CodecError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}
