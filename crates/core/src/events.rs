use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FailureKind;
use crate::fallback::{Device, ModelId};
use crate::orchestrator::OrchestratorState;

/// Why the fallback policy moved to another candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    OutOfMemory,
    LoadFailure,
}

/// Progress notifications for one upscale request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UpscaleEvent {
    Planned {
        tiles: usize,
        columns: usize,
        rows: usize,
    },
    StateChanged {
        from: OrchestratorState,
        to: OrchestratorState,
    },
    TileStarted {
        index: usize,
        model: ModelId,
        device: Device,
        attempt: usize,
    },
    TileCompleted {
        index: usize,
        model: ModelId,
        device: Device,
        elapsed_ms: u64,
    },
    FallbackAdvanced {
        tile: usize,
        reason: FallbackReason,
        from_model: ModelId,
        from_device: Device,
        to_model: ModelId,
        to_device: Device,
    },
    Finished {
        succeeded: bool,
        failure: Option<FailureKind>,
        tiles_processed: usize,
        elapsed_ms: u64,
    },
}

pub type UpscaleEventObserver = dyn Fn(&UpscaleEvent) + Send + Sync;

/// Logs the event and forwards it to the observer, if any.
pub(crate) fn emit(observer: Option<&Arc<UpscaleEventObserver>>, event: UpscaleEvent) {
    match &event {
        UpscaleEvent::Planned {
            tiles,
            columns,
            rows,
        } => debug!(tiles, columns, rows, "Tile plan ready"),
        UpscaleEvent::StateChanged { from, to } => debug!(?from, ?to, "Orchestrator state"),
        UpscaleEvent::TileStarted {
            index,
            model,
            device,
            attempt,
        } => debug!(tile = index, %model, %device, attempt, "Tile started"),
        UpscaleEvent::TileCompleted {
            index,
            model,
            device,
            elapsed_ms,
        } => debug!(tile = index, %model, %device, elapsed_ms, "Tile completed"),
        UpscaleEvent::FallbackAdvanced {
            tile,
            reason,
            from_model,
            from_device,
            to_model,
            to_device,
        } => warn!(
            tile,
            ?reason,
            %from_model,
            %from_device,
            %to_model,
            %to_device,
            "Fallback advanced"
        ),
        UpscaleEvent::Finished {
            succeeded,
            failure,
            tiles_processed,
            elapsed_ms,
        } => info!(
            succeeded,
            failure = failure.map(|k| k.as_str()).unwrap_or("none"),
            tiles_processed,
            elapsed_ms,
            "Upscale request finished"
        ),
    }
    if let Some(observer) = observer {
        observer(&event);
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}
