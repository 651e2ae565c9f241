mod fetch;
pub mod session;
pub mod sources;

pub use sources::ModelSourceConfig;
