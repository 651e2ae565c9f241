mod orchestrator;
mod protocol;
mod worker;
pub mod phase;

pub use orchestrator::{EngineConfig, LoadOptions, MatteEngine, SEGMENT_TIMEOUT};
