use std::time::Duration;
use thiserror::Error;

/// Failures surfaced to callers of the matting engine.
///
/// Per-source load failures and second-pass refinement failures are swallowed
/// internally and reported as phase diagnostics; only aggregate failures
/// reach this taxonomy.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Resolution produced zero candidate model sources. Surfaced before any
    /// fetch or worker round-trip.
    #[error("no model sources configured (set MATTEBOX_MODEL_URLS or pass --model)")]
    NoModelSources,

    /// Every candidate source was tried and failed; carries the last
    /// underlying error. The next load call retries from scratch.
    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    /// The controller-side watchdog expired before a reply arrived.
    #[error("segmentation timed out after {}s", .0.as_secs())]
    SegmentTimeout(Duration),

    /// Inference failed with no further provider fallback available.
    #[error("segmentation failed: {0}")]
    SegmentationFailed(String),

    /// The forced-portable session rebuild itself failed.
    #[error("provider fallback rebuild failed: {0}")]
    FallbackExhausted(String),

    /// The worker thread or its channels are gone.
    #[error("inference worker is not running")]
    WorkerGone,
}

pub type Result<T> = std::result::Result<T, EngineError>;
