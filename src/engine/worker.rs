use crate::engine::phase::{PhaseEvent, PhaseSink};
use crate::engine::protocol::{WorkerMessage, WorkerRequest};
use crate::error::{EngineError, Result};
use crate::model::session::SessionManager;
use crate::segmentation::pipeline;
use crossbeam_channel::{Receiver, Sender};
use image::RgbaImage;

/// Worker-level settings fixed at spawn time.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerConfig {
    pub intra_threads: Option<usize>,
}

/// Forwards phase breadcrumbs over the worker's outbound channel.
/// Best-effort: a disconnected controller just drops them.
struct PhasePort {
    out: Sender<WorkerMessage>,
}

impl PhaseSink for PhasePort {
    fn phase(&self, phase: &str, detail: Option<&str>) {
        let _ = self.out.send(WorkerMessage::Phase(PhaseEvent {
            phase: phase.to_string(),
            detail: detail.map(str::to_string),
        }));
    }
}

/// Spawn the inference worker thread. It owns the model session exclusively
/// and processes one request at a time until the inbox closes.
pub fn spawn(
    config: WorkerConfig,
    inbox: Receiver<WorkerRequest>,
    out: Sender<WorkerMessage>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || run(config, inbox, out))
}

fn run(config: WorkerConfig, inbox: Receiver<WorkerRequest>, out: Sender<WorkerMessage>) {
    let phases = PhasePort { out: out.clone() };
    phases.phase("boot", Some("worker_online"));

    let mut manager = match SessionManager::new(config.intra_threads) {
        Ok(manager) => manager,
        Err(e) => {
            let message = format!("worker startup failed: {e:#}");
            tracing::error!("{}", message);
            phases.phase("worker_error", Some(&message));
            // Answer everything with the startup error so callers fail fast
            // instead of waiting out their timeouts
            for request in inbox.iter() {
                let err = match &request {
                    WorkerRequest::Load { .. } => EngineError::ModelLoadFailed(message.clone()),
                    WorkerRequest::Segment { .. } => {
                        EngineError::SegmentationFailed(message.clone())
                    }
                };
                let _ = out.send(WorkerMessage::Reply {
                    id: request.id(),
                    result: Err(err),
                });
            }
            return;
        }
    };

    for request in inbox.iter() {
        let id = request.id();
        let kind = request.kind();
        tracing::debug!("Handling {} request {}", kind, id);

        let result = handle(&mut manager, request, &phases);
        if let Err(e) = &result {
            phases.phase("error", Some(&e.to_string()));
        }
        if out.send(WorkerMessage::Reply { id, result }).is_err() {
            break;
        }
    }
    tracing::debug!("Worker inbox closed, shutting down");
}

fn handle(
    manager: &mut SessionManager,
    request: WorkerRequest,
    phases: &PhasePort,
) -> Result<Option<RgbaImage>> {
    match request {
        WorkerRequest::Load {
            sources,
            force_provider_fallback,
            ..
        } => {
            let _span = tracing::debug_span!("load").entered();
            if force_provider_fallback {
                manager.force_cpu_only();
                phases.phase("force_cpu_only", Some("1"));
            }
            manager.ensure_loaded(&sources, phases)?;
            Ok(None)
        }
        WorkerRequest::Segment {
            image,
            sources,
            config,
            ..
        } => {
            let alpha = pipeline::run_segment(manager, &sources, &image, &config, phases)?;
            Ok(Some(alpha))
        }
    }
}
