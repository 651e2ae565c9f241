use crate::engine::phase::PhaseEvent;
use crate::error::EngineError;
use crate::segmentation::pipeline::PipelineConfig;
use image::{RgbImage, RgbaImage};

/// Controller-to-worker request. Ids are unique per engine instance and
/// never reused; the terminal reply echoes the id back.
///
/// Pixel buffers move with the request. The sender gives up ownership, so
/// nothing is shared across the thread boundary.
pub enum WorkerRequest {
    Load {
        id: u64,
        sources: Vec<String>,
        force_provider_fallback: bool,
    },
    Segment {
        id: u64,
        image: RgbImage,
        sources: Vec<String>,
        config: PipelineConfig,
    },
}

impl WorkerRequest {
    pub fn id(&self) -> u64 {
        match self {
            WorkerRequest::Load { id, .. } | WorkerRequest::Segment { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::Load { .. } => "load",
            WorkerRequest::Segment { .. } => "segment",
        }
    }
}

/// Worker-to-controller traffic: interleaved best-effort diagnostics and
/// exactly one terminal reply per request id.
pub enum WorkerMessage {
    Phase(PhaseEvent),
    Reply {
        id: u64,
        /// Load replies carry no payload; segment replies carry the alpha
        /// image on success.
        result: Result<Option<RgbaImage>, EngineError>,
    },
}
