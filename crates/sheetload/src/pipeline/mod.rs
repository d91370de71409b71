pub mod config;
pub mod error;
pub mod runner;

pub use config::PipelineConfig;
pub use error::IngestError;
pub use runner::Pipeline;
