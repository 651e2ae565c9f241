use crate::engine::phase::PhaseSink;
use crate::error::{EngineError, Result};
use crate::model::session::{ActiveSession, SessionManager};
use crate::segmentation::letterbox::{self, LetterboxMeta};
use crate::segmentation::refine;
use crate::segmentation::tensor::{self, MattePlane};
use image::{imageops, RgbImage, RgbaImage};
use ort::value::Tensor;
use std::time::{Duration, Instant};

/// Canvas side length inference runs at unless overridden.
pub const DEFAULT_TARGET: u32 = 1024;

/// Inference slower than this on an accelerated provider trips the watchdog.
pub const WATCHDOG_SLOW: Duration = Duration::from_secs(30);

/// Original plus one fallback retry.
pub const MAX_ATTEMPTS: u32 = 2;

/// Mask values above this count as foreground when boxing the subject.
const FG_THRESHOLD: u8 = 24;

/// Padding added around the subject box before the detail pass, per axis.
const CROP_PAD: f64 = 0.12;

/// Skip the detail pass when the crop covers at least this fraction of both
/// original dimensions.
const COVERAGE_SKIP: f64 = 0.97;

/// Per-request knobs, resolved once by the host and carried with each
/// segment request.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub target: u32,
    /// Render at exactly `target` even for inputs small enough to shrink the
    /// canvas. Applies to the base pass; the detail pass always renders
    /// exact.
    pub force_exact: bool,
    pub slow_infer_threshold: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET,
            force_exact: false,
            slow_infer_threshold: WATCHDOG_SLOW,
        }
    }
}

/// Bounded retry counter for one logical segment request.
#[derive(Debug, Clone, Copy)]
pub struct AttemptBudget {
    index: u32,
    max: u32,
}

impl AttemptBudget {
    pub fn new(max: u32) -> Self {
        Self { index: 0, max }
    }

    /// Start the next attempt. Returns false once the budget is spent.
    pub fn begin(&mut self) -> bool {
        if self.index < self.max {
            self.index += 1;
            true
        } else {
            false
        }
    }

    /// Whether another attempt is available after the current one.
    pub fn has_remaining(&self) -> bool {
        self.index < self.max
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// What to do with a failed inference attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Rebuild under the portable provider and run the request again.
    FallbackAndRetry,
    /// Rebuild for the benefit of later requests, but surface this failure.
    FallbackNoRetry,
    /// No fallback path left; surface the failure.
    Propagate,
}

/// Decide the fallback route for an inference error.
///
/// Only a non-portable session with the fallback flag unset has anywhere to
/// degrade to. From there, any error retries while the attempt budget lasts;
/// a timeout-looking error on the final attempt still rebuilds portable so
/// the next request starts degraded.
pub fn classify_failure(
    portable: bool,
    flag_set: bool,
    timeout_like: bool,
    attempts_remaining: bool,
) -> FailureAction {
    if portable || flag_set {
        return FailureAction::Propagate;
    }
    if attempts_remaining {
        FailureAction::FallbackAndRetry
    } else if timeout_like {
        FailureAction::FallbackNoRetry
    } else {
        FailureAction::Propagate
    }
}

/// Whether a slow-but-successful inference should trigger the fallback.
/// Strictly slower than the threshold, and only when a faster tier is still
/// in play.
pub fn watchdog_trips(
    portable: bool,
    flag_set: bool,
    elapsed: Duration,
    threshold: Duration,
) -> bool {
    !portable && !flag_set && elapsed > threshold
}

pub fn is_timeout_like(message: &str) -> bool {
    message.to_ascii_lowercase().contains("timeout")
}

/// Raw model output for one pass plus the geometry to invert it.
pub struct InferOutcome {
    pub plane: MattePlane,
    pub meta: LetterboxMeta,
    pub elapsed: Duration,
}

/// One refined pass: black RGB with the mask in the alpha channel at canvas
/// size, plus the pre-feather subject bounds in canvas coordinates.
pub struct RefinedPass {
    pub rgba: RgbaImage,
    pub bounds: Option<MaskBounds>,
}

/// Inclusive pixel bounds of the detected subject, in mask coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskBounds {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

/// Crop window in original-image coordinates for the detail pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Letterbox, pack, and run one inference pass over `image`.
fn infer_letterboxed(
    active: &mut ActiveSession,
    image: &RgbImage,
    target: u32,
    force_exact: bool,
    timing_phase: &str,
    sink: &dyn PhaseSink,
) -> anyhow::Result<InferOutcome> {
    let meta = letterbox::plan(image.width(), image.height(), target, force_exact);
    let canvas = letterbox::render(image, &meta);
    let input = Tensor::from_array(tensor::pack_rgb(&canvas))?;

    let started = Instant::now();
    let outputs = active
        .session
        .run(ort::inputs![active.input_name.as_str() => &input])?;
    let elapsed = started.elapsed();
    sink.phase(
        timing_phase,
        Some(&format!("{:.1}", elapsed.as_secs_f64() * 1000.0)),
    );

    let output = match outputs.get(active.output_name.as_str()) {
        Some(output) => output,
        None => {
            sink.phase(
                "segment_fail",
                Some(&format!("missing_output:{}", active.output_name)),
            );
            anyhow::bail!("missing output tensor {}", active.output_name);
        }
    };
    let view = output.try_extract_array::<f32>()?;
    let plane = tensor::unpack_alpha(view)?;
    Ok(InferOutcome {
        plane,
        meta,
        elapsed,
    })
}

/// Run the full alpha refinement over one raw output plane: sigmoid
/// normalization when the values look like logits, quantization, boundary
/// feathering with gamma shaping, and RGBA packing.
pub fn refine_outcome(mut plane: MattePlane, sink: &dyn PhaseSink) -> RefinedPass {
    if refine::needs_sigmoid(&plane.data) {
        refine::apply_sigmoid(&mut plane.data);
        sink.phase("applied_sigmoid", None);
    }

    let mut mask = refine::quantize(&plane.data);
    // Box the subject before feathering softens the edges
    let bounds = foreground_bounds(&mask, plane.width, plane.height);
    refine::boundary_feather(&mut mask, plane.width as usize, plane.height as usize);

    RefinedPass {
        rgba: refine::compose_rgba(&mask, plane.width, plane.height),
        bounds,
    }
}

/// Tight bounds of all mask pixels strictly above the foreground threshold.
pub fn foreground_bounds(mask: &[u8], width: u32, height: u32) -> Option<MaskBounds> {
    let mut found: Option<MaskBounds> = None;
    for y in 0..height {
        for x in 0..width {
            if mask[(y * width + x) as usize] > FG_THRESHOLD {
                match found.as_mut() {
                    Some(b) => {
                        b.min_x = b.min_x.min(x);
                        b.min_y = b.min_y.min(y);
                        b.max_x = b.max_x.max(x);
                        b.max_y = b.max_y.max(y);
                    }
                    None => {
                        found = Some(MaskBounds {
                            min_x: x,
                            min_y: y,
                            max_x: x,
                            max_y: y,
                        });
                    }
                }
            }
        }
    }
    found
}

/// Map subject bounds back to original-image coordinates, pad them, and
/// decide whether a detail pass is worthwhile.
///
/// Returns None when the bounds land entirely in letterbox padding or when
/// the padded crop covers nearly the whole image on both axes.
pub fn plan_refine_crop(bounds: MaskBounds, meta: &LetterboxMeta) -> Option<CropRegion> {
    let last_x = i64::from(meta.orig_w) - 1;
    let last_y = i64::from(meta.orig_h) - 1;
    let scale = f64::from(meta.scale);

    let floor_orig = |v: u32, off: u32| ((f64::from(v) - f64::from(off)) / scale).floor() as i64;
    let ceil_orig = |v: u32, off: u32| ((f64::from(v) - f64::from(off)) / scale).ceil() as i64;

    let mut min_x = floor_orig(bounds.min_x, meta.dx).max(0);
    let mut max_x = ceil_orig(bounds.max_x, meta.dx).min(last_x);
    let mut min_y = floor_orig(bounds.min_y, meta.dy).max(0);
    let mut max_y = ceil_orig(bounds.max_y, meta.dy).min(last_y);
    if max_x < min_x || max_y < min_y {
        return None;
    }

    let pad_x = ((max_x - min_x + 1) as f64 * CROP_PAD).round() as i64;
    let pad_y = ((max_y - min_y + 1) as f64 * CROP_PAD).round() as i64;
    min_x = (min_x - pad_x).max(0);
    max_x = (max_x + pad_x).min(last_x);
    min_y = (min_y - pad_y).max(0);
    max_y = (max_y + pad_y).min(last_y);

    let width = (max_x - min_x + 1) as u32;
    let height = (max_y - min_y + 1) as u32;
    if f64::from(width) >= f64::from(meta.orig_w) * COVERAGE_SKIP
        && f64::from(height) >= f64::from(meta.orig_h) * COVERAGE_SKIP
    {
        return None;
    }

    Some(CropRegion {
        x: min_x as u32,
        y: min_y as u32,
        width,
        height,
    })
}

/// Overwrite the alpha channel of `base` inside `region` with the crop's
/// alpha. RGB and everything outside the region keep their base values.
pub fn merge_crop_alpha(base: &mut RgbaImage, crop: &RgbaImage, region: CropRegion) {
    let w = region.width.min(crop.width());
    let h = region.height.min(crop.height());
    for yy in 0..h {
        for xx in 0..w {
            let dst_x = region.x + xx;
            let dst_y = region.y + yy;
            if dst_x < base.width() && dst_y < base.height() {
                base.get_pixel_mut(dst_x, dst_y)[3] = crop.get_pixel(xx, yy)[3];
            }
        }
    }
}

fn run_detail_pass(
    active: &mut ActiveSession,
    image: &RgbImage,
    base: &mut RgbaImage,
    region: CropRegion,
    config: &PipelineConfig,
    sink: &dyn PhaseSink,
) -> anyhow::Result<()> {
    let crop = imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image();
    // The crop always renders at the full canvas size, which is the whole
    // point: more pixels on the subject than the base pass gave it
    let outcome = infer_letterboxed(active, &crop, config.target, true, "infer_ms_pass2", sink)?;
    let refined = refine_outcome(outcome.plane, sink);
    let crop_alpha = letterbox::unletterbox(&refined.rgba, &outcome.meta);
    merge_crop_alpha(base, &crop_alpha, region);
    sink.phase("refine_pass2_done", None);
    Ok(())
}

/// Best-effort detail pass over the subject crop. Failures are diagnosed and
/// swallowed; the base alpha stays authoritative.
fn refine_detail_pass(
    active: &mut ActiveSession,
    image: &RgbImage,
    base: &mut RgbaImage,
    region: CropRegion,
    config: &PipelineConfig,
    sink: &dyn PhaseSink,
) {
    let _span = tracing::debug_span!("detail_pass").entered();
    sink.phase(
        "refine_pass2_start",
        Some(&format!("{}x{}", region.width, region.height)),
    );
    if let Err(e) = run_detail_pass(active, image, base, region, config, sink) {
        tracing::warn!("Detail pass failed: {:#}", e);
        sink.phase("refine_pass2_error", Some(&format!("{e:#}")));
    }
}

fn finish_segment(
    manager: &mut SessionManager,
    image: &RgbImage,
    outcome: InferOutcome,
    config: &PipelineConfig,
    sink: &dyn PhaseSink,
) -> RgbaImage {
    let pass1 = refine_outcome(outcome.plane, sink);
    let mut alpha = letterbox::unletterbox(&pass1.rgba, &outcome.meta);

    if let Some(bounds) = pass1.bounds {
        if let Some(region) = plan_refine_crop(bounds, &outcome.meta) {
            if let Some(active) = manager.active() {
                refine_detail_pass(active, image, &mut alpha, region, config, sink);
            }
        }
    }
    alpha
}

/// Run one segment request end to end: ensure a session, then attempt
/// inference with the adaptive fallback machinery, then refine.
pub fn run_segment(
    manager: &mut SessionManager,
    sources: &[String],
    image: &RgbImage,
    config: &PipelineConfig,
    sink: &dyn PhaseSink,
) -> Result<RgbaImage> {
    let _span = tracing::debug_span!("segment").entered();
    manager.ensure_loaded(sources, sink)?;

    if let Some(active) = manager.active() {
        if !active.io_shapes_logged {
            sink.phase(
                "io_shapes",
                Some(&format!("{}:{}", active.input_name, active.output_name)),
            );
            active.io_shapes_logged = true;
        }
    }

    let mut budget = AttemptBudget::new(MAX_ATTEMPTS);
    let mut last_err: Option<EngineError> = None;

    while budget.begin() {
        let flag_set = manager.cpu_only();
        let active = match manager.active() {
            Some(active) => active,
            None => {
                last_err = Some(EngineError::SegmentationFailed(
                    "no active session".to_string(),
                ));
                break;
            }
        };
        let portable = active.provider.is_portable();
        tracing::debug!(
            "Inference attempt {} via {}",
            budget.index(),
            active.provider.label()
        );

        match infer_letterboxed(active, image, config.target, config.force_exact, "infer_ms", sink)
        {
            Ok(outcome) => {
                if watchdog_trips(portable, flag_set, outcome.elapsed, config.slow_infer_threshold)
                    && budget.has_remaining()
                {
                    let ms = outcome.elapsed.as_secs_f64() * 1000.0;
                    sink.phase(
                        "adaptive_fallback_trigger",
                        Some(&format!("slow_inference_{ms:.0}")),
                    );
                    match manager.rebuild_portable(sources, sink) {
                        Ok(()) => {
                            sink.phase("adaptive_fallback_retry", None);
                            continue;
                        }
                        Err(e) => return Err(EngineError::FallbackExhausted(e.to_string())),
                    }
                }
                return Ok(finish_segment(manager, image, outcome, config, sink));
            }
            Err(e) => {
                let message = format!("{e:#}");
                let timeout_like = is_timeout_like(&message);
                let action =
                    classify_failure(portable, flag_set, timeout_like, budget.has_remaining());
                tracing::warn!("Inference attempt {} failed: {}", budget.index(), message);

                match action {
                    FailureAction::Propagate => {
                        return Err(EngineError::SegmentationFailed(message))
                    }
                    FailureAction::FallbackAndRetry | FailureAction::FallbackNoRetry => {
                        let label = if timeout_like { "timeout" } else { "error" };
                        sink.phase(
                            "adaptive_fallback_trigger",
                            Some(&format!("{label}:{message}")),
                        );
                        if let Err(rebuild) = manager.rebuild_portable(sources, sink) {
                            return Err(EngineError::FallbackExhausted(rebuild.to_string()));
                        }
                        if matches!(action, FailureAction::FallbackAndRetry) {
                            sink.phase("adaptive_fallback_retry", None);
                            last_err = Some(EngineError::SegmentationFailed(message));
                            continue;
                        }
                        return Err(EngineError::SegmentationFailed(message));
                    }
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        EngineError::SegmentationFailed("no inference attempt completed".to_string())
    }))
}
