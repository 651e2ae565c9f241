mod letterbox;
mod refine;
mod tensor;
pub mod pipeline;

pub use pipeline::PipelineConfig;
