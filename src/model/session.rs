use crate::engine::phase::PhaseSink;
use crate::error::{EngineError, Result};
use crate::model::fetch::ModelFetcher;
use anyhow::Context;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, TensorRTExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};

/// Which execution-provider tier a session was built under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    /// Hardware ladder: TensorRT, then CUDA, with CPU as the runtime's own
    /// last resort.
    Accelerated,
    /// Portable tier only.
    CpuOnly,
}

impl ProviderMode {
    pub fn label(self) -> &'static str {
        match self {
            ProviderMode::Accelerated => "tensorrt+cuda+cpu",
            ProviderMode::CpuOnly => "cpu",
        }
    }

    pub fn is_portable(self) -> bool {
        matches!(self, ProviderMode::CpuOnly)
    }
}

/// A constructed ONNX session plus the metadata inference binds by.
pub struct ActiveSession {
    pub session: Session,
    pub provider: ProviderMode,
    pub input_name: String,
    pub output_name: String,
    pub io_shapes_logged: bool,
}

enum SessionState {
    Unloaded,
    Loading,
    Ready(Box<ActiveSession>),
}

/// Owns the worker's single session and the monotonic fallback flag.
///
/// Lifecycle: `Unloaded -> Loading -> Ready`, back to `Loading` on adaptive
/// fallback, and back to `Unloaded` on failure so a later call retries from
/// scratch. The worker thread drives one request at a time, so `Loading` is
/// never observed by a second request; the state exists to make the
/// transitions explicit.
pub struct SessionManager {
    state: SessionState,
    cpu_only: bool,
    intra_threads: Option<usize>,
    fetcher: ModelFetcher,
}

impl SessionManager {
    pub fn new(intra_threads: Option<usize>) -> anyhow::Result<Self> {
        Ok(Self {
            state: SessionState::Unloaded,
            cpu_only: false,
            intra_threads,
            fetcher: ModelFetcher::new()?,
        })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, SessionState::Ready(_))
    }

    pub fn cpu_only(&self) -> bool {
        self.cpu_only
    }

    /// Set the monotonic fallback flag. Nothing ever clears it.
    pub fn force_cpu_only(&mut self) {
        self.cpu_only = true;
    }

    /// Provider tier the next session build will request.
    pub fn provider_mode(&self) -> ProviderMode {
        if self.cpu_only {
            ProviderMode::CpuOnly
        } else {
            ProviderMode::Accelerated
        }
    }

    pub fn active(&mut self) -> Option<&mut ActiveSession> {
        match &mut self.state {
            SessionState::Ready(active) => Some(active),
            _ => None,
        }
    }

    /// Make sure a session exists: no-op when ready, otherwise try each
    /// source in order and stop at the first that fetches and builds.
    /// Individual source failures are diagnosed and swallowed; only full
    /// exhaustion fails, carrying the last underlying error.
    pub fn ensure_loaded(&mut self, sources: &[String], sink: &dyn PhaseSink) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        self.state = SessionState::Loading;
        let mut last_err: Option<anyhow::Error> = None;

        for source in sources {
            sink.phase("fetch", Some(source));
            let bytes = match self.fetcher.fetch(source) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("Model source {} failed: {:#}", source, e);
                    sink.phase("source_fail", Some(&format!("{source} :: {e:#}")));
                    last_err = Some(e);
                    continue;
                }
            };

            sink.phase("init", Some(&format!("{source} ({} bytes)", bytes.len())));
            match self.build_session(&bytes, sink) {
                Ok(active) => {
                    tracing::info!("Model ready from {} via {}", source, active.provider.label());
                    self.state = SessionState::Ready(Box::new(active));
                    sink.phase("ready", Some(source));
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Model source {} failed: {:#}", source, e);
                    sink.phase("source_fail", Some(&format!("{source} :: {e:#}")));
                    last_err = Some(e);
                }
            }
        }

        // All sources exhausted; clear the loading state so a later call
        // starts over
        self.state = SessionState::Unloaded;
        let detail = last_err
            .map(|e| format!("{e:#}"))
            .unwrap_or_else(|| "no model sources".to_string());
        sink.phase("error", Some(&detail));
        Err(EngineError::ModelLoadFailed(detail))
    }

    /// Drop the current session and rebuild under the portable tier. Used by
    /// the adaptive fallback path; the flag stays set afterward regardless
    /// of the rebuild outcome.
    pub fn rebuild_portable(&mut self, sources: &[String], sink: &dyn PhaseSink) -> Result<()> {
        self.cpu_only = true;
        self.state = SessionState::Unloaded;
        sink.phase("adaptive_fallback_reinit", Some("cpu"));
        self.ensure_loaded(sources, sink)
    }

    fn build_session(&self, bytes: &[u8], sink: &dyn PhaseSink) -> anyhow::Result<ActiveSession> {
        let mode = self.provider_mode();
        sink.phase("provider_try", Some(mode.label()));

        let threads = self.resolve_intra_threads();
        sink.phase("intra_threads", Some(&threads.to_string()));

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(threads)?;
        let builder = match mode {
            ProviderMode::Accelerated => builder.with_execution_providers([
                TensorRTExecutionProvider::default().build(),
                CUDAExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ])?,
            ProviderMode::CpuOnly => {
                builder.with_execution_providers([CPUExecutionProvider::default().build()])?
            }
        };

        let session = match builder.commit_from_memory(bytes) {
            Ok(session) => session,
            Err(e) => {
                sink.phase("provider_fail", Some(&format!("{} :: {e}", mode.label())));
                return Err(e).context("Failed to build inference session");
            }
        };

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.to_string())
            .context("Model declares no inputs")?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.to_string())
            .context("Model declares no outputs")?;

        sink.phase("provider", Some(mode.label()));
        Ok(ActiveSession {
            session,
            provider: mode,
            input_name,
            output_name,
            io_shapes_logged: false,
        })
    }

    /// Numeric-kernel parallelism: explicit override, else available
    /// parallelism clamped to a sane band, else single-threaded.
    fn resolve_intra_threads(&self) -> usize {
        self.intra_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get().clamp(1, 8))
                .unwrap_or(1)
        })
    }
}
