use crate::engine::phase::{PhaseBus, PhaseEvent, PhaseSink, PhaseSubscription};
use crate::engine::protocol::{WorkerMessage, WorkerRequest};
use crate::engine::worker::{self, WorkerConfig};
use crate::error::{EngineError, Result};
use crate::segmentation::pipeline::PipelineConfig;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use image::{RgbImage, RgbaImage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Wall-clock budget for one segment request, first inference included.
pub const SEGMENT_TIMEOUT: Duration = Duration::from_secs(180);

/// Engine-wide settings fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub segment_timeout: Duration,
    pub pipeline: PipelineConfig,
    pub intra_threads: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            segment_timeout: SEGMENT_TIMEOUT,
            pipeline: PipelineConfig::default(),
            intra_threads: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Skip the accelerated providers outright and build portable.
    pub force_provider_fallback: bool,
}

type ReplyResult = std::result::Result<Option<RgbaImage>, EngineError>;
type PendingMap = Arc<Mutex<HashMap<u64, Sender<ReplyResult>>>>;

/// Caller-facing matting engine.
///
/// Owns the inference worker thread and a router thread that correlates its
/// replies back to waiting callers by request id. One instance per process
/// is the intended shape; the worker holds the only model session.
pub struct MatteEngine {
    sources: Vec<String>,
    config: EngineConfig,
    bus: PhaseBus,
    ready: Arc<AtomicBool>,
    next_id: AtomicU64,
    pending: PendingMap,
    gate: LoadGate,
    to_worker: Option<Sender<WorkerRequest>>,
    worker: Option<std::thread::JoinHandle<()>>,
    router: Option<std::thread::JoinHandle<()>>,
}

impl MatteEngine {
    /// Construct the engine and start its worker. `sources` is the resolved
    /// model source list; it may be empty, in which case load and segment
    /// calls fail with a configuration error.
    pub fn new(sources: Vec<String>, config: EngineConfig) -> Self {
        let (to_worker, inbox) = unbounded();
        let (from_worker, worker_out) = unbounded();
        let worker = worker::spawn(
            WorkerConfig {
                intra_threads: config.intra_threads,
            },
            inbox,
            from_worker,
        );

        let bus = PhaseBus::new();
        let ready = Arc::new(AtomicBool::new(false));
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let router = spawn_router(worker_out, bus.clone(), ready.clone(), pending.clone());

        Self {
            sources,
            config,
            bus,
            ready,
            next_id: AtomicU64::new(0),
            pending,
            gate: LoadGate::new(),
            to_worker: Some(to_worker),
            worker: Some(worker),
            router: Some(router),
        }
    }

    /// True once a load has completed successfully.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn model_sources(&self) -> &[String] {
        &self.sources
    }

    /// Register a diagnostic observer. Handlers run on whichever thread
    /// emits the event and must not assume ordering against other
    /// diagnostics.
    pub fn on_phase<F>(&self, handler: F) -> PhaseSubscription
    where
        F: Fn(&PhaseEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    /// Load the model. Idempotent: an already-ready engine returns
    /// immediately, and concurrent calls collapse onto the in-flight load
    /// and share its outcome. No timeout is imposed; progress is visible
    /// through phase events.
    pub fn load_model(&self, options: LoadOptions) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        if self.sources.is_empty() {
            self.bus.phase(
                "config_error_no_model_sources",
                Some("set MATTEBOX_MODEL_URLS or pass --model"),
            );
            return Err(EngineError::NoModelSources);
        }

        match self.gate.begin() {
            GateRole::Initiator => {
                self.bus.phase("model_sources", Some(&self.sources.join(",")));
                let result = self.request_load(options);
                if result.is_ok() {
                    self.ready.store(true, Ordering::SeqCst);
                }
                self.gate.finish(result.as_ref().err().cloned());
                result
            }
            GateRole::Joiner(epoch) => self.gate.join(epoch),
        }
    }

    /// Segment `image` into an RGBA alpha mask at the image's dimensions.
    /// The pixel buffer moves to the worker; the reply is awaited up to the
    /// configured segment timeout, after which any late reply is discarded.
    pub fn segment(&self, image: RgbImage) -> Result<RgbaImage> {
        if self.sources.is_empty() {
            self.bus.phase(
                "config_error_no_model_sources",
                Some("set MATTEBOX_MODEL_URLS or pass --model"),
            );
            return Err(EngineError::NoModelSources);
        }

        let (reply_tx, reply_rx) = bounded(1);
        let id = self.register_pending(reply_tx);
        self.bus.phase("request_out", Some(&id.to_string()));
        self.send(WorkerRequest::Segment {
            id,
            image,
            sources: self.sources.clone(),
            config: self.config.pipeline,
        })?;

        match reply_rx.recv_timeout(self.config.segment_timeout) {
            Ok(Ok(Some(alpha))) => Ok(alpha),
            Ok(Ok(None)) => Err(EngineError::SegmentationFailed(
                "empty segment reply".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => {
                self.remove_pending(id);
                self.bus.phase("segment_timeout", Some(&id.to_string()));
                Err(EngineError::SegmentTimeout(self.config.segment_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.remove_pending(id);
                Err(EngineError::WorkerGone)
            }
        }
    }

    fn request_load(&self, options: LoadOptions) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        let id = self.register_pending(reply_tx);
        self.send(WorkerRequest::Load {
            id,
            sources: self.sources.clone(),
            force_provider_fallback: options.force_provider_fallback,
        })?;

        match reply_rx.recv() {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.remove_pending(id);
                Err(EngineError::WorkerGone)
            }
        }
    }

    fn register_pending(&self, reply_tx: Sender<ReplyResult>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, reply_tx);
        id
    }

    fn remove_pending(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn send(&self, request: WorkerRequest) -> Result<()> {
        let id = request.id();
        let sender = match &self.to_worker {
            Some(sender) => sender,
            None => return Err(EngineError::WorkerGone),
        };
        if sender.send(request).is_err() {
            self.remove_pending(id);
            return Err(EngineError::WorkerGone);
        }
        Ok(())
    }
}

impl Drop for MatteEngine {
    fn drop(&mut self) {
        // Closing the request channel ends the worker; the worker's outbound
        // side closing then ends the router
        drop(self.to_worker.take());
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.router.take() {
            let _ = handle.join();
        }
    }
}

/// Route worker traffic: phases fan out to observers, replies resolve the
/// matching pending entry. A reply with no entry was already timed out and
/// is discarded with a diagnostic.
fn spawn_router(
    from_worker: Receiver<WorkerMessage>,
    bus: PhaseBus,
    ready: Arc<AtomicBool>,
    pending: PendingMap,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for message in from_worker.iter() {
            match message {
                WorkerMessage::Phase(event) => {
                    bus.emit(&event);
                    if event.phase == "ready" {
                        ready.store(true, Ordering::SeqCst);
                    }
                }
                WorkerMessage::Reply { id, result } => {
                    let entry = pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(&id);
                    match entry {
                        Some(reply_tx) => {
                            let status = if result.is_ok() { "ok" } else { "fail" };
                            bus.phase("request_in", Some(&format!("{id}:{status}")));
                            let _ = reply_tx.send(result);
                        }
                        None => {
                            bus.phase("request_unmatched", Some(&id.to_string()));
                        }
                    }
                }
            }
        }
        // Worker gone: fail whatever is still waiting instead of letting
        // callers run out their timeouts
        let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, reply_tx) in map.drain() {
            let _ = reply_tx.send(Err(EngineError::WorkerGone));
        }
    })
}

enum GateRole {
    Initiator,
    Joiner(u64),
}

#[derive(Default)]
struct GateState {
    loading: bool,
    epoch: u64,
    last_error: Option<EngineError>,
}

/// Collapses concurrent load calls onto one in-flight attempt. The first
/// caller becomes the initiator; later callers wait on the same outcome.
struct LoadGate {
    state: Mutex<GateState>,
    done: Condvar,
}

impl LoadGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            done: Condvar::new(),
        }
    }

    fn begin(&self) -> GateRole {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.loading {
            GateRole::Joiner(state.epoch)
        } else {
            state.loading = true;
            GateRole::Initiator
        }
    }

    fn finish(&self, error: Option<EngineError>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.loading = false;
        state.epoch += 1;
        state.last_error = error;
        self.done.notify_all();
    }

    fn join(&self, epoch: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.loading && state.epoch == epoch {
            state = self.done.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        match &state.last_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Instant;

    fn bogus() -> String {
        "/mattebox-test/missing.onnx".to_string()
    }

    fn phase_log(engine: &MatteEngine) -> (Arc<Mutex<Vec<PhaseEvent>>>, PhaseSubscription) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let sub = engine.on_phase(move |event| sink.lock().unwrap().push(event.clone()));
        (log, sub)
    }

    fn names(log: &Arc<Mutex<Vec<PhaseEvent>>>) -> Vec<String> {
        log.lock().unwrap().iter().map(|e| e.phase.clone()).collect()
    }

    #[test]
    fn load_without_sources_fails_fast() {
        let engine = MatteEngine::new(Vec::new(), EngineConfig::default());
        let (log, _sub) = phase_log(&engine);

        let err = engine.load_model(LoadOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::NoModelSources));
        assert!(!engine.is_ready());
        assert!(names(&log).contains(&"config_error_no_model_sources".to_string()));
    }

    #[test]
    fn segment_without_sources_fails_fast() {
        let engine = MatteEngine::new(Vec::new(), EngineConfig::default());
        let err = engine.segment(RgbImage::new(4, 4)).unwrap_err();
        assert!(matches!(err, EngineError::NoModelSources));
    }

    #[test]
    fn failed_load_is_reported_and_retryable() {
        let engine = MatteEngine::new(vec![bogus()], EngineConfig::default());
        let (log, _sub) = phase_log(&engine);

        let err = engine.load_model(LoadOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::ModelLoadFailed(_)));
        assert!(!engine.is_ready());

        // A later call retries instead of caching the failure
        let err = engine.load_model(LoadOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::ModelLoadFailed(_)));

        let phases = names(&log);
        assert_eq!(phases.iter().filter(|p| *p == "model_sources").count(), 2);
        assert_eq!(phases.iter().filter(|p| *p == "fetch").count(), 2);
    }

    #[test]
    fn segment_surfaces_worker_load_failure() {
        let engine = MatteEngine::new(vec![bogus()], EngineConfig::default());
        let err = engine.segment(RgbImage::new(8, 8)).unwrap_err();
        assert!(matches!(err, EngineError::ModelLoadFailed(_)));
    }

    #[test]
    fn segment_times_out_and_discards_the_late_reply() {
        let config = EngineConfig {
            segment_timeout: Duration::from_millis(10),
            ..EngineConfig::default()
        };
        let engine = MatteEngine::new(vec![bogus()], config);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        // Stall the router on every event so the reply cannot beat the
        // timeout
        let _sub = engine.on_phase(move |event| {
            sink.lock().unwrap().push(event.clone());
            std::thread::sleep(Duration::from_millis(300));
        });

        let err = engine.segment(RgbImage::new(8, 8)).unwrap_err();
        assert!(matches!(err, EngineError::SegmentTimeout(_)));

        // The worker's reply eventually arrives and is dropped as unmatched
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let seen = log
                .lock()
                .unwrap()
                .iter()
                .any(|e| e.phase == "request_unmatched");
            if seen {
                break;
            }
            assert!(Instant::now() < deadline, "late reply was never flagged");
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    #[test]
    fn concurrent_loads_collapse_onto_one_attempt() {
        let engine = Arc::new(MatteEngine::new(vec![bogus()], EngineConfig::default()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        // Slow the router down to hold the load in flight while the second
        // caller arrives
        let _sub = engine.on_phase(move |event| {
            sink.lock().unwrap().push(event.clone());
            std::thread::sleep(Duration::from_millis(100));
        });

        let barrier = Arc::new(Barrier::new(2));
        let mut workers = Vec::new();
        for _ in 0..2 {
            let engine = engine.clone();
            let barrier = barrier.clone();
            workers.push(std::thread::spawn(move || {
                barrier.wait();
                engine.load_model(LoadOptions::default())
            }));
        }
        for handle in workers {
            let result = handle.join().unwrap();
            assert!(matches!(
                result.unwrap_err(),
                EngineError::ModelLoadFailed(_)
            ));
        }

        // One underlying attempt: one source list announcement, one fetch
        let phases: Vec<String> = log.lock().unwrap().iter().map(|e| e.phase.clone()).collect();
        assert_eq!(phases.iter().filter(|p| *p == "model_sources").count(), 1);
        assert_eq!(phases.iter().filter(|p| *p == "fetch").count(), 1);
    }

    #[test]
    fn request_ids_are_monotonic_and_unique() {
        let engine = MatteEngine::new(vec![bogus()], EngineConfig::default());
        let (log, _sub) = phase_log(&engine);

        let _ = engine.segment(RgbImage::new(4, 4));
        let _ = engine.segment(RgbImage::new(4, 4));

        let outs: Vec<String> = log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.phase == "request_out")
            .filter_map(|e| e.detail.clone())
            .collect();
        assert_eq!(outs, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn gate_roles_and_epochs() {
        let gate = LoadGate::new();
        assert!(matches!(gate.begin(), GateRole::Initiator));
        assert!(matches!(gate.begin(), GateRole::Joiner(0)));

        gate.finish(Some(EngineError::WorkerGone));
        // Joiners of a finished epoch read its outcome without waiting
        assert!(matches!(gate.join(0), Err(EngineError::WorkerGone)));

        assert!(matches!(gate.begin(), GateRole::Initiator));
        gate.finish(None);
        assert!(gate.join(1).is_ok());
    }
}
