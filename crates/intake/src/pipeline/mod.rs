pub mod config;
pub mod context;
pub mod error;
pub mod progress;
pub mod runner;

pub use config::PipelineConfig;
pub use context::{JobContext, JobControl};
pub use error::PipelineError;
pub use progress::{
    BroadcastProgress, JobPhase, JobProgressEvent, NoopProgress, ProgressEvent, ProgressReporter,
};
pub use runner::IngestionPipeline;
