use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// One diagnostic breadcrumb from the engine or its worker. Best-effort:
/// phases carry no control-flow meaning and may be dropped or reordered
/// relative to other diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseEvent {
    pub phase: String,
    pub detail: Option<String>,
}

/// Anything that can record a phase breadcrumb. The worker-side pipeline
/// reports through this so it stays unaware of the channel plumbing.
pub trait PhaseSink {
    fn phase(&self, phase: &str, detail: Option<&str>);
}

type PhaseHandler = Box<dyn Fn(&PhaseEvent) + Send + Sync + 'static>;
type HandlerMap = Arc<Mutex<HashMap<u64, PhaseHandler>>>;

/// Fan-out registry for phase observers. A handler that panics is isolated
/// so one broken observer cannot affect the others or the pipeline.
#[derive(Clone, Default)]
pub struct PhaseBus {
    handlers: HandlerMap,
    next_id: Arc<AtomicU64>,
}

impl PhaseBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. It stays registered until the returned
    /// subscription is explicitly unsubscribed.
    pub fn subscribe<F>(&self, handler: F) -> PhaseSubscription
    where
        F: Fn(&PhaseEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(id, Box::new(handler));
        }
        PhaseSubscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    pub fn emit(&self, event: &PhaseEvent) {
        let handlers = match self.handlers.lock() {
            Ok(handlers) => handlers,
            Err(_) => return,
        };
        for handler in handlers.values() {
            let _ = catch_unwind(AssertUnwindSafe(|| handler(event)));
        }
    }

    pub fn observer_count(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl PhaseSink for PhaseBus {
    fn phase(&self, phase: &str, detail: Option<&str>) {
        self.emit(&PhaseEvent {
            phase: phase.to_string(),
            detail: detail.map(str::to_string),
        });
    }
}

/// Handle for one registered observer.
pub struct PhaseSubscription {
    id: u64,
    handlers: Weak<Mutex<HashMap<u64, PhaseHandler>>>,
}

impl PhaseSubscription {
    pub fn unsubscribe(self) {
        if let Some(handlers) = self.handlers.upgrade() {
            if let Ok(mut handlers) = handlers.lock() {
                handlers.remove(&self.id);
            }
        }
    }
}

/// Test sink that records every phase it sees.
#[cfg(test)]
pub(crate) struct CollectSink(pub Mutex<Vec<PhaseEvent>>);

#[cfg(test)]
impl CollectSink {
    pub fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    pub fn phases(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.phase.clone())
            .collect()
    }

    pub fn detail_of(&self, phase: &str) -> Option<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.phase == phase)
            .and_then(|e| e.detail.clone())
    }
}

#[cfg(test)]
impl PhaseSink for CollectSink {
    fn phase(&self, phase: &str, detail: Option<&str>) {
        self.0.lock().unwrap().push(PhaseEvent {
            phase: phase.to_string(),
            detail: detail.map(str::to_string),
        });
    }
}
